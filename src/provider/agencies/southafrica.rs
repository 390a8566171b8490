//! DWS verified hydrology (South Africa).
//!
//! The `HyData` page renders its table as plain text inside a `<pre>` block.
//! Rows start with an eight-digit `YYYYMMDD` date and follow a `DATE` header
//! line. Stage comes from point readings (several per day, averaged) and is
//! served one year per request; daily discharge allows twenty years.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;

use super::{http_client, rate_limiter};
use crate::acquisition::{AcquisitionEngine, AcquisitionPlan, ChunkPolicy, RequestPlanner};
use crate::config::ProviderConfig;
use crate::provider::{DateWindow, Provider, ProviderError, RawData, RawPage};
use crate::series::{MergePolicy, Observation};
use crate::transport::HttpRequest;
use crate::variable::{Aggregation, Quantity, Resolution, Variable, VariableSet, variable_set};

/// Registry name.
pub const NAME: &str = "southafrica";

/// `HyData` page.
pub const DEFAULT_BASE_URL: &str = "https://www.dws.gov.za/Hydrology/Verified/HyData.aspx";

const READ_TIMEOUT_SECS: u64 = 120;

#[allow(clippy::expect_used)]
static PRE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<pre[^>]*>(.*?)</pre>").expect("pre block regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static DATA_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}").expect("data row regex is valid")); // Static pattern, safe to panic

/// DWS adapter.
#[derive(Debug)]
pub struct SouthAfricaProvider {
    base_url: String,
    engine: AcquisitionEngine,
    variables: VariableSet,
}

/// Query shape for one variable.
struct Table {
    data_type: &'static str,
    chunk_years: u32,
    value_column: usize,
}

fn table_for(variable: &Variable) -> Option<Table> {
    match variable.quantity() {
        // DATE TIME COR_LEVEL COR_LEVEL_QUAL COR_FLOW COR_FLOW_QUAL
        Quantity::Stage => Some(Table {
            data_type: "Point",
            chunk_years: 1,
            value_column: 2,
        }),
        // DATE D_AVG_FR QUAL
        Quantity::Discharge => Some(Table {
            data_type: "Daily",
            chunk_years: 20,
            value_column: 1,
        }),
        _ => None,
    }
}

impl SouthAfricaProvider {
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
                (Quantity::Stage, Resolution::Daily, Aggregation::Mean),
            ]),
        })
    }
}

/// Pulls `(date, value)` pairs out of a `HyData` page.
///
/// Returns `None` when the page has no `<pre>` block.
fn scrape_rows(html: &str, value_column: usize) -> Option<Vec<(NaiveDate, Option<f64>)>> {
    let text = PRE_BLOCK.captures(html)?.get(1)?.as_str();
    let mut header_seen = false;
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("DATE") {
            header_seen = true;
            continue;
        }
        if !header_seen || !DATA_ROW.is_match(line) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(date) = fields
            .first()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        else {
            continue;
        };
        let value = fields.get(value_column).and_then(|v| v.parse::<f64>().ok());
        rows.push((date, value));
    }
    Some(rows)
}

impl RequestPlanner for SouthAfricaProvider {
    fn plan_request(&self, gauge_id: &str, variable: &Variable, window: &DateWindow) -> HttpRequest {
        let data_type = table_for(variable).map_or("Daily", |t| t.data_type);
        HttpRequest::new(self.base_url.clone())
            .param("Station", format!("{gauge_id}100.00"))
            .param("DataType", data_type)
            .param("StartDT", window.start.to_string())
            .param("EndDT", window.end.to_string())
            .param("SiteType", "RIV")
    }
}

#[async_trait]
impl Provider for SouthAfricaProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn available_variables(&self) -> &VariableSet {
        &self.variables
    }

    /// Point readings on one day are averaged into the daily value.
    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::Mean
    }

    async fn download(
        &self,
        gauge_id: &str,
        variable: &Variable,
        window: DateWindow,
    ) -> Result<RawData, ProviderError> {
        let Some(table) = table_for(variable) else {
            return Ok(RawData::Pages(Vec::new()));
        };
        let plan = AcquisitionPlan::new(ChunkPolicy::ByYears(table.chunk_years));
        let pages = self
            .engine
            .walk(self, &plan, gauge_id, variable, window.start, window.end)
            .await;
        Ok(RawData::Pages(pages))
    }

    fn parse_chunk(
        &self,
        _gauge_id: &str,
        page: &RawPage,
        variable: &Variable,
    ) -> Result<Vec<Observation>, ProviderError> {
        let table =
            table_for(variable).ok_or_else(|| ProviderError::parse(&page.url, "unsupported variable"))?;
        if page.body.contains("No data for this period") {
            return Ok(Vec::new());
        }
        let rows = scrape_rows(&page.body, table.value_column)
            .ok_or_else(|| ProviderError::parse(&page.url, "no <pre> table in page"))?;
        Ok(rows
            .into_iter()
            .filter(|(_, value)| value.is_some())
            .map(|(date, value)| Observation::on_date(date, value))
            .collect())
    }
}
