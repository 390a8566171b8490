//! NVE `HydAPI` (Norway).
//!
//! Every request carries the API key in the `X-API-Key` header; without a key
//! the adapter is disabled. Daily series come back for the whole range in one
//! response, in SI units already.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{http_client, json_number, rate_limiter, to_si};
use crate::acquisition::{AcquisitionEngine, AcquisitionPlan, ChunkPolicy, RequestPlanner};
use crate::config::ProviderConfig;
use crate::provider::{DateWindow, Provider, ProviderError, RawData, RawPage};
use crate::series::{Observation, StationMetadata, parse_timestamp, truncate_to_day};
use crate::session::{AuthSession, TokenPlacement};
use crate::transport::HttpRequest;
use crate::variable::{
    Aggregation, Quantity, Resolution, Variable, VariableSet, unit_for, variable_set,
};

/// Registry name.
pub const NAME: &str = "norway";

/// API root.
pub const DEFAULT_BASE_URL: &str = "https://hydapi.nve.no/api/v1";

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Daily resolution, in minutes.
const DAILY_RESOLUTION: &str = "1440";
const READ_TIMEOUT_SECS: u64 = 120;

/// NVE adapter.
#[derive(Debug)]
pub struct NorwayProvider {
    base_url: String,
    engine: AcquisitionEngine,
    session: Arc<AuthSession>,
    variables: VariableSet,
}

impl NorwayProvider {
    /// Creates the adapter. A missing key is not an error here; the adapter
    /// reports it through [`Provider::credentials_missing`].
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = http_client(config, READ_TIMEOUT_SECS)?;
        let session = Arc::new(AuthSession::static_key(
            NAME,
            config.api_key().unwrap_or_default(),
            TokenPlacement::header(API_KEY_HEADER),
        ));
        let engine = AcquisitionEngine::new(client, rate_limiter(config, None))
            .with_session(Arc::clone(&session));
        Ok(Self {
            base_url: config.base_url_or(DEFAULT_BASE_URL),
            engine,
            session,
            variables: variable_set(&[
                (Quantity::Stage, Resolution::Daily, Aggregation::Mean),
                (Quantity::Discharge, Resolution::Daily, Aggregation::Mean),
                (Quantity::WaterTemperature, Resolution::Daily, Aggregation::Mean),
            ]),
        })
    }

    async fn stations(&self, active: u8) -> Result<Vec<Station>, ProviderError> {
        let request = HttpRequest::new(format!("{}/Stations", self.base_url))
            .param("Active", active.to_string())
            .header("Accept", "application/json");
        let response = self.engine.fetch(request, true).await?;
        let envelope: Envelope<Station> = response
            .json()
            .map_err(|e| ProviderError::parse(response.url(), e.to_string()))?;
        Ok(envelope.data)
    }
}

/// `HydAPI` parameter code for `variable`.
fn parameter(variable: &Variable) -> Option<u16> {
    match variable.quantity() {
        Quantity::Stage => Some(1000),
        Quantity::Discharge => Some(1001),
        Quantity::WaterTemperature => Some(1003),
        Quantity::CatchmentPrecipitation => None,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SeriesBlock {
    #[serde(default)]
    observations: Vec<Point>,
}

#[derive(Debug, Deserialize)]
struct Point {
    time: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Station {
    station_id: String,
    station_name: Option<String>,
    river_name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    masl: Option<f64>,
    catchment_area: Option<f64>,
}

impl RequestPlanner for NorwayProvider {
    fn plan_request(&self, gauge_id: &str, variable: &Variable, window: &DateWindow) -> HttpRequest {
        let parameter = parameter(variable).map(|p| p.to_string()).unwrap_or_default();
        HttpRequest::new(format!("{}/Observations", self.base_url))
            .param("StationId", gauge_id)
            .param("Parameter", parameter)
            .param("ResolutionTime", DAILY_RESOLUTION)
            .param("ReferenceTime", format!("{}/{}", window.start, window.end))
            .header("Accept", "application/json")
    }
}

#[async_trait]
impl Provider for NorwayProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn available_variables(&self) -> &VariableSet {
        &self.variables
    }

    fn credentials_missing(&self) -> bool {
        !self.session.has_credentials()
    }

    /// Active and inactive stations, deduplicated by id.
    #[instrument(skip(self))]
    async fn metadata(&self) -> Result<Option<Vec<StationMetadata>>, ProviderError> {
        let mut seen = HashSet::new();
        let mut catalog = Vec::new();
        for active in [0, 1] {
            let stations = match self.stations(active).await {
                Ok(stations) => stations,
                Err(error) => {
                    warn!(active, error = %error, "station list unavailable");
                    continue;
                }
            };
            for station in stations {
                if !seen.insert(station.station_id.clone()) {
                    continue;
                }
                catalog.push(StationMetadata {
                    name: station.station_name,
                    river: station.river_name,
                    latitude: station.latitude,
                    longitude: station.longitude,
                    altitude: station.masl,
                    area: station.catchment_area,
                    country: Some("Norway".to_string()),
                    source: Some("NVE HydAPI".to_string()),
                    ..StationMetadata::new(station.station_id)
                });
            }
        }
        debug!(stations = catalog.len(), "station catalog merged");
        Ok(Some(catalog))
    }

    async fn download(
        &self,
        gauge_id: &str,
        variable: &Variable,
        window: DateWindow,
    ) -> Result<RawData, ProviderError> {
        let plan = AcquisitionPlan::new(ChunkPolicy::None).requiring_token();
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
        let envelope: Envelope<SeriesBlock> = serde_json::from_str(&page.body)
            .map_err(|e| ProviderError::parse(&page.url, e.to_string()))?;
        let unit = unit_for(variable.quantity());

        let mut observations = Vec::new();
        for point in envelope.data.iter().flat_map(|block| &block.observations) {
            let Some(timestamp) = parse_timestamp(&point.time) else {
                continue;
            };
            let Some(raw) = json_number(&point.value) else {
                continue;
            };
            observations.push(Observation::new(
                truncate_to_day(timestamp),
                to_si(Some(raw), unit, variable)?,
            ));
        }
        Ok(observations)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::provider::{FetchError, get_data};
    use crate::series::start_of_day;
    use crate::session::Credentials;
    use crate::test_support::socket_guard::start_mock_server_or_skip;

    fn provider(base_url: &str, key: Option<&str>) -> NorwayProvider {
        NorwayProvider::new(&ProviderConfig {
            base_url: Some(base_url.to_string()),
            credentials: key.map(|k| Credentials::ApiKey(k.to_string())),
            ..ProviderConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_key_is_configuration_error() {
        let no = provider("http://unused", None);
        assert!(no.credentials_missing());
        let err = get_data(&no, "12.209.0", "discharge-daily-mean", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingCredentials { .. }));
    }

    #[tokio::test]
    async fn test_get_data_sends_key_and_truncates_to_day() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/Observations"))
            .and(header("X-API-Key", "secret"))
            .and(query_param("StationId", "12.209.0"))
            .and(query_param("Parameter", "1001"))
            .and(query_param("ResolutionTime", "1440"))
            .and(query_param("ReferenceTime", "2020-01-01/2020-01-02"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":[{"stationId":"12.209.0","parameter":1001,"observations":[
                    {"time":"2020-01-01T11:00:00Z","value":4.2,"quality":2},
                    {"time":"2020-01-02T11:00:00Z","value":null,"quality":0}
                ]}]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let no = provider(&server.uri(), Some("secret"));
        let series = get_data(&no, "12.209.0", "discharge-daily-mean", Some("2020-01-01"), Some("2020-01-02"))
            .await
            .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(
            series.observations()[0].timestamp,
            start_of_day(chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
        );
        assert_eq!(series.observations()[0].value, Some(4.2));
    }

    #[tokio::test]
    async fn test_metadata_merges_active_and_inactive() {
        let Some(server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/Stations"))
            .and(query_param("Active", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":[{"stationId":"2.11.0","stationName":"Narsjø","riverName":"Glomma","masl":737.0}]}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Stations"))
            .and(query_param("Active", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"data":[
                    {"stationId":"2.11.0","stationName":"Narsjø"},
                    {"stationId":"12.209.0","stationName":"Etna","catchmentArea":570.0}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let catalog = provider(&server.uri(), Some("secret"))
            .metadata()
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<_> = catalog.iter().map(|s| s.gauge_id.as_str()).collect();
        assert_eq!(ids, vec!["2.11.0", "12.209.0"]);
        assert_eq!(catalog[0].altitude, Some(737.0));
        assert_eq!(catalog[1].area, Some(570.0));
    }
}
