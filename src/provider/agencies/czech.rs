//! CHMI open data (Czech Republic).
//!
//! Historical series are static JSON files, one per station and year. A file
//! bundles several series under `tsList`, told apart by `tsConID`; each holds a
//! comma-separated header and rows of values. Stage is reported in centimetres.

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
pub const NAME: &str = "czech";

/// Open data portal root.
pub const DEFAULT_BASE_URL: &str = "https://opendata.chmi.cz";

const READ_TIMEOUT_SECS: u64 = 60;

/// CHMI adapter.
#[derive(Debug)]
pub struct CzechProvider {
    base_url: String,
    engine: AcquisitionEngine,
    variables: VariableSet,
}

/// Where a variable lives: file family, series id and reporting unit.
struct SeriesLocation {
    folder: &'static str,
    file_code: &'static str,
    ts_con_id: &'static str,
    unit: Unit,
}

fn locate(variable: &Variable) -> Option<SeriesLocation> {
    let daily = |ts_con_id, unit| SeriesLocation {
        folder: "daily",
        file_code: "DQ",
        ts_con_id,
        unit,
    };
    let hourly = |ts_con_id, unit| SeriesLocation {
        folder: "hourly",
        file_code: "HQ",
        ts_con_id,
        unit,
    };
    match (variable.quantity(), variable.resolution(), variable.aggregation()) {
        (Quantity::Discharge, Resolution::Daily, Aggregation::Mean) => {
            Some(daily("QD", Unit::CubicMetresPerSecond))
        }
        (Quantity::Stage, Resolution::Daily, Aggregation::Mean) => Some(daily("HD", Unit::Centimetre)),
        (Quantity::WaterTemperature, Resolution::Daily, Aggregation::Mean) => {
            Some(daily("TD", Unit::DegreesCelsius))
        }
        (Quantity::Discharge, Resolution::Hourly, Aggregation::Mean) => {
            Some(hourly("QH", Unit::CubicMetresPerSecond))
        }
        (Quantity::Stage, Resolution::Hourly, Aggregation::Mean) => {
            Some(hourly("HH", Unit::Centimetre))
        }
        _ => None,
    }
}

impl CzechProvider {
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
                (Quantity::WaterTemperature, Resolution::Daily, Aggregation::Mean),
                (Quantity::Discharge, Resolution::Hourly, Aggregation::Mean),
                (Quantity::Stage, Resolution::Hourly, Aggregation::Mean),
            ]),
        })
    }
}

/// Header-plus-rows table used by both data and metadata files.
#[derive(Debug, Default, Deserialize)]
struct Table {
    #[serde(default)]
    header: String,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.header.split(',').position(|h| h.trim() == name)
    }
}

#[derive(Debug, Deserialize)]
struct YearFile {
    #[serde(rename = "tsList", default)]
    ts_list: Vec<SeriesEntry>,
}

#[derive(Debug, Deserialize)]
struct SeriesEntry {
    #[serde(rename = "tsConID", default)]
    ts_con_id: String,
    #[serde(rename = "tsData")]
    ts_data: Option<TableHolder>,
}

#[derive(Debug, Deserialize)]
struct TableHolder {
    data: Option<Table>,
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    data: TableHolder,
}

impl RequestPlanner for CzechProvider {
    fn plan_request(&self, gauge_id: &str, variable: &Variable, window: &DateWindow) -> HttpRequest {
        let (folder, code) = locate(variable).map_or(("daily", "DQ"), |l| (l.folder, l.file_code));
        HttpRequest::new(format!(
            "{}/hydrology/historical/data/{folder}/H_{gauge_id}_{code}_{}.json",
            self.base_url,
            window.start.format("%Y")
        ))
    }
}

#[async_trait]
impl Provider for CzechProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn available_variables(&self) -> &VariableSet {
        &self.variables
    }

    #[instrument(skip(self))]
    async fn metadata(&self) -> Result<Option<Vec<StationMetadata>>, ProviderError> {
        let request = HttpRequest::new(format!(
            "{}/hydrology/historical/metadata/meta1.json",
            self.base_url
        ));
        let response = self.engine.fetch(request, false).await?;
        let file: MetadataFile = response
            .json()
            .map_err(|e| ProviderError::parse(response.url(), e.to_string()))?;
        let table = file
            .data
            .data
            .ok_or_else(|| ProviderError::parse(response.url(), "missing data.data table"))?;

        let id_col = table
            .column("objID")
            .ok_or_else(|| ProviderError::parse(response.url(), "missing objID column"))?;
        let text = |row: &[serde_json::Value], col: Option<usize>| {
            col.and_then(|c| row.get(c)).and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
        };
        let number = |row: &[serde_json::Value], col: Option<usize>| {
            col.and_then(|c| row.get(c)).and_then(json_number)
        };
        let (name, river, lat, lon, area) = (
            table.column("STATION_NAME"),
            table.column("STREAM_NAME"),
            table.column("GEOGR1"),
            table.column("GEOGR2"),
            table.column("PLO_STA"),
        );

        let catalog: Vec<_> = table
            .values
            .iter()
            .filter_map(|row| {
                let gauge_id = text(row, Some(id_col))?;
                Some(StationMetadata {
                    name: text(row, name),
                    river: text(row, river),
                    latitude: number(row, lat),
                    longitude: number(row, lon),
                    area: number(row, area),
                    country: Some("Czech Republic".to_string()),
                    source: Some("CHMI Open Data".to_string()),
                    ..StationMetadata::new(gauge_id)
                })
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
        let plan = AcquisitionPlan::new(ChunkPolicy::ByYear);
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
        let location =
            locate(variable).ok_or_else(|| ProviderError::parse(&page.url, "unsupported variable"))?;
        let file: YearFile = serde_json::from_str(&page.body)
            .map_err(|e| ProviderError::parse(&page.url, e.to_string()))?;

        let mut observations = Vec::new();
        for entry in file
            .ts_list
            .iter()
            .filter(|e| e.ts_con_id.eq_ignore_ascii_case(location.ts_con_id))
        {
            let Some(table) = entry.ts_data.as_ref().and_then(|d| d.data.as_ref()) else {
                continue;
            };
            let (Some(dt), Some(val)) = (table.column("DT"), table.column("VAL")) else {
                return Err(ProviderError::parse(&page.url, "missing DT/VAL columns"));
            };
            for row in &table.values {
                let Some(timestamp) = row
                    .get(dt)
                    .and_then(serde_json::Value::as_str)
                    .and_then(parse_timestamp)
                else {
                    continue;
                };
                let Some(raw) = row.get(val).and_then(json_number) else {
                    continue;
                };
                observations.push(Observation::new(
                    timestamp,
                    to_si(Some(raw), location.unit, variable)?,
                ));
            }
        }
        if observations.is_empty() {
            debug!(url = %page.url, ts_con_id = location.ts_con_id, "series not present in file");
        }
        Ok(observations)
    }
}
