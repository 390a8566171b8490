//! Hub'Eau hydrometry (France).
//!
//! Elaborated observations (`obs_elab`) come back in pages of up to 20 000
//! records; each page names the next one in its `next` field. A page shorter
//! than the requested size is the last one, whatever `next` says. A failed
//! page leaves a gap nobody can fill from later pages, so the walk is strict.
//! Discharge is reported in L/s and stage in mm.

use async_trait::async_trait;
use serde::Deserialize;

use super::{http_client, json_number, rate_limiter, to_si};
use crate::acquisition::{AcquisitionEngine, AcquisitionPlan, ChunkPolicy, RequestPlanner};
use crate::config::ProviderConfig;
use crate::provider::{DateWindow, Provider, ProviderError, RawData, RawPage};
use crate::series::{Observation, parse_timestamp};
use crate::transport::{HttpRequest, HttpResponse};
use crate::variable::{Aggregation, Quantity, Resolution, Unit, Variable, VariableSet, variable_set};

/// Registry name.
pub const NAME: &str = "france";

/// Hydrometry API root.
pub const DEFAULT_BASE_URL: &str = "https://hubeau.eaufrance.fr/api/v2/hydrometrie";

/// Largest page the API serves.
pub const PAGE_SIZE: usize = 20_000;

const MAX_PAGES: usize = 500;
const READ_TIMEOUT_SECS: u64 = 120;

/// Hub'Eau adapter.
#[derive(Debug)]
pub struct FranceProvider {
    base_url: String,
    engine: AcquisitionEngine,
    variables: VariableSet,
    page_size: usize,
}

impl FranceProvider {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = http_client(config, READ_TIMEOUT_SECS)?;
        Ok(Self {
            base_url: config.base_url_or(DEFAULT_BASE_URL),
            engine: AcquisitionEngine::new(client, rate_limiter(config, None)),
            variables: variable_set(&[
                (Quantity::Discharge, Resolution::Daily, Aggregation::Mean),
                (Quantity::Discharge, Resolution::Monthly, Aggregation::Mean),
                (Quantity::Discharge, Resolution::Daily, Aggregation::Max),
                (Quantity::Stage, Resolution::Daily, Aggregation::Max),
            ]),
            page_size: PAGE_SIZE,
        })
    }

    /// Requests pages of `size` records instead of [`PAGE_SIZE`].
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.clamp(1, PAGE_SIZE);
        self
    }

    fn plan() -> AcquisitionPlan {
        AcquisitionPlan::new(ChunkPolicy::Cursor {
            max_pages: MAX_PAGES,
        })
        .strict()
    }
}

/// `grandeur_hydro_elab` code and reporting unit for `variable`.
fn series_code(variable: &Variable) -> Option<(&'static str, Unit)> {
    match (
        variable.quantity(),
        variable.resolution(),
        variable.aggregation(),
    ) {
        (Quantity::Discharge, Resolution::Daily, Aggregation::Mean) => {
            Some(("QmnJ", Unit::LitresPerSecond))
        }
        (Quantity::Discharge, Resolution::Monthly, Aggregation::Mean) => {
            Some(("QmM", Unit::LitresPerSecond))
        }
        (Quantity::Discharge, Resolution::Daily, Aggregation::Max) => {
            Some(("QIXnJ", Unit::LitresPerSecond))
        }
        (Quantity::Stage, Resolution::Daily, Aggregation::Max) => Some(("HIXnJ", Unit::Millimetre)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Record>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Record {
    date_obs_elab: Option<String>,
    #[serde(default)]
    resultat_obs_elab: serde_json::Value,
    grandeur_hydro_elab: Option<String>,
}

impl RequestPlanner for FranceProvider {
    fn plan_request(&self, gauge_id: &str, variable: &Variable, window: &DateWindow) -> HttpRequest {
        let code = series_code(variable).map_or("", |(code, _)| code);
        HttpRequest::new(format!("{}/obs_elab", self.base_url))
            .param("code_entite", gauge_id)
            .param("date_debut_obs_elab", window.start.to_string())
            .param("date_fin_obs_elab", window.end.to_string())
            .param("grandeur_hydro_elab", code)
            .param("size", self.page_size.to_string())
    }

    fn next_page(&self, _: &HttpRequest, response: &HttpResponse) -> Option<HttpRequest> {
        let page: Page = response.json().ok()?;
        if page.data.len() < self.page_size {
            return None;
        }
        page.next
            .filter(|next| !next.is_empty())
            .map(HttpRequest::new)
    }
}

#[async_trait]
impl Provider for FranceProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn available_variables(&self) -> &VariableSet {
        &self.variables
    }

    async fn download(
        &self,
        gauge_id: &str,
        variable: &Variable,
        window: DateWindow,
    ) -> Result<RawData, ProviderError> {
        let pages = self
            .engine
            .walk(self, &Self::plan(), gauge_id, variable, window.start, window.end)
            .await;
        Ok(RawData::Pages(pages))
    }

    fn parse_chunk(
        &self,
        _gauge_id: &str,
        page: &RawPage,
        variable: &Variable,
    ) -> Result<Vec<Observation>, ProviderError> {
        let (code, unit) =
            series_code(variable).ok_or_else(|| ProviderError::parse(&page.url, "unsupported variable"))?;
        let parsed: Page = serde_json::from_str(&page.body)
            .map_err(|e| ProviderError::parse(&page.url, e.to_string()))?;

        let mut observations = Vec::with_capacity(parsed.data.len());
        for record in parsed.data {
            if record.grandeur_hydro_elab.as_deref().is_some_and(|g| g != code) {
                continue;
            }
            let Some(timestamp) = record.date_obs_elab.as_deref().and_then(parse_timestamp) else {
                continue;
            };
            let Some(raw) = json_number(&record.resultat_obs_elab) else {
                continue;
            };
            observations.push(Observation::new(timestamp, to_si(Some(raw), unit, variable)?));
        }
        Ok(observations)
    }
}
