//! Meteo.lt (Lithuania).
//!
//! Historical observations are served one month per request at
//! `/hydro-stations/{code}/observations/historical/{YYYY-MM}`; months without
//! records answer 404. The service allows 180 requests per minute. Stage is
//! reported in centimetres.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{http_client, json_number, rate_limiter, to_si};
use crate::acquisition::{AcquisitionEngine, AcquisitionPlan, ChunkPolicy, RequestPlanner};
use crate::config::ProviderConfig;
use crate::provider::{DateWindow, Provider, ProviderError, RawData, RawPage};
use crate::series::{Observation, StationMetadata, parse_timestamp};
use crate::transport::HttpRequest;
use crate::variable::{Aggregation, Quantity, Resolution, Unit, Variable, VariableSet, variable_set};

/// Registry name.
pub const NAME: &str = "lithuania";

/// Public API root.
pub const DEFAULT_BASE_URL: &str = "https://api.meteo.lt/v1";

/// Published request cap.
pub const REQUESTS_PER_MINUTE: usize = 180;

const READ_TIMEOUT_SECS: u64 = 20;

/// Meteo.lt adapter.
#[derive(Debug)]
pub struct LithuaniaProvider {
    base_url: String,
    engine: AcquisitionEngine,
    variables: VariableSet,
}

impl LithuaniaProvider {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = http_client(config, READ_TIMEOUT_SECS)?;
        Ok(Self {
            base_url: config.base_url_or(DEFAULT_BASE_URL),
            engine: AcquisitionEngine::new(client, rate_limiter(config, Some(REQUESTS_PER_MINUTE))),
            variables: variable_set(&[
                (Quantity::Discharge, Resolution::Daily, Aggregation::Mean),
                (Quantity::Stage, Resolution::Daily, Aggregation::Mean),
            ]),
        })
    }

    fn plan() -> AcquisitionPlan {
        AcquisitionPlan::new(ChunkPolicy::ByMonth)
    }
}

/// JSON field holding `variable` in an observation record.
fn field_for(variable: &Variable) -> Option<(&'static str, Unit)> {
    match variable.quantity() {
        Quantity::Discharge => Some(("waterDischarge", Unit::CubicMetresPerSecond)),
        Quantity::Stage => Some(("waterLevel", Unit::Centimetre)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ObservationsPage {
    #[serde(default)]
    observations: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct Station {
    code: serde_json::Value,
    name: Option<String>,
    #[serde(rename = "waterBody")]
    water_body: Option<String>,
    coordinates: Option<Coordinates>,
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl RequestPlanner for LithuaniaProvider {
    fn plan_request(&self, gauge_id: &str, _: &Variable, window: &DateWindow) -> HttpRequest {
        HttpRequest::new(format!(
            "{}/hydro-stations/{gauge_id}/observations/historical/{}",
            self.base_url,
            window.start.format("%Y-%m")
        ))
        .header("Accept", "application/json")
    }
}

#[async_trait]
impl Provider for LithuaniaProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn available_variables(&self) -> &VariableSet {
        &self.variables
    }

    #[instrument(skip(self))]
    async fn metadata(&self) -> Result<Option<Vec<StationMetadata>>, ProviderError> {
        let request = HttpRequest::new(format!("{}/hydro-stations", self.base_url))
            .header("Accept", "application/json");
        let response = self.engine.fetch(request, false).await?;
        let stations: Vec<Station> = response
            .json()
            .map_err(|e| ProviderError::parse(response.url(), e.to_string()))?;

        let catalog: Vec<_> = stations
            .into_iter()
            .map(|station| {
                let gauge_id = match &station.code {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    other => other.to_string(),
                };
                StationMetadata {
                    name: station.name,
                    river: station.water_body,
                    latitude: station.coordinates.as_ref().and_then(|c| c.latitude),
                    longitude: station.coordinates.as_ref().and_then(|c| c.longitude),
                    country: Some("Lithuania".to_string()),
                    source: Some("Meteo.lt".to_string()),
                    ..StationMetadata::new(gauge_id)
                }
            })
            .collect();
        debug!(stations = catalog.len(), "station catalog parsed");
        Ok(Some(catalog))
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
        let (field, unit) =
            field_for(variable).ok_or_else(|| ProviderError::parse(&page.url, "unsupported variable"))?;
        let parsed: ObservationsPage = serde_json::from_str(&page.body)
            .map_err(|e| ProviderError::parse(&page.url, e.to_string()))?;

        let mut observations = Vec::with_capacity(parsed.observations.len());
        for record in &parsed.observations {
            let Some(timestamp) = record
                .get("observationDateUtc")
                .and_then(serde_json::Value::as_str)
                .and_then(parse_timestamp)
            else {
                continue;
            };
            let Some(raw) = record.get(field).and_then(json_number) else {
                continue;
            };
            observations.push(Observation::new(timestamp, to_si(Some(raw), unit, variable)?));
        }
        Ok(observations)
    }
}
