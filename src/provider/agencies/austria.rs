//! eHYD (Austria).
//!
//! eHYD has no query API. The whole surface-water archive is one ZIP with a
//! folder per series type (`Q-Tagesmittel`, `W-Monatsmaxima`, ...) and one
//! Latin-1 CSV per station, so it is downloaded once into the bulk cache and
//! sliced from there. Series missing from the archive are fetched through
//! the per-station export, which serves the same file layout.
//!
//! File layout: free-text header, a line starting with `Werte`, then
//! `dd.mm.yyyy [HH:MM:SS] value` rows with comma decimals. Stage is in
//! centimetres.
//!
//! The archive also carries `messstellen_owf.csv`, the station catalog, with
//! positions in MGI / Austria Lambert (EPSG:31287). They are converted to
//! WGS84 while the cache is built.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::{http_client, rate_limiter};
use crate::acquisition::AcquisitionEngine;
use crate::cache::{ArchiveDecoder, BuildOutcome, BulkCache, BulkStore, CacheError, CacheRow};
use crate::config::ProviderConfig;
use crate::provider::{CandidateList, DateWindow, Provider, ProviderError, RawData, RawPage};
use crate::series::{MergePolicy, Observation, StationMetadata};
use crate::transport::{HttpClient, HttpRequest};
use crate::variable::{
    Aggregation, Quantity, Resolution, Unit, Variable, VariableSet, convert, variable_set,
};

/// Registry name.
pub const NAME: &str = "austria";

/// eHYD root.
pub const DEFAULT_BASE_URL: &str = "https://ehyd.gv.at/eHYD";

/// Bulk cache database file inside the cache directory.
pub const CACHE_FILE: &str = "bulk-cache.db";

const READ_TIMEOUT_SECS: u64 = 300;

#[allow(clippy::expect_used)]
static STATION_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.csv$").expect("station file regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static FIELD_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[;\t\s]+").expect("field separator regex is valid") // Static pattern, safe to panic
});

/// One series type in the archive.
#[derive(Debug, Clone, Copy)]
struct SeriesFolder {
    folder: &'static str,
    quantity: Quantity,
    resolution: Resolution,
    aggregation: Aggregation,
    unit: Unit,
    /// `file` numbers of the per-station export that may hold this series.
    station_files: &'static [u8],
}

impl SeriesFolder {
    fn variable(&self) -> Variable {
        Variable::new(self.quantity, self.resolution, self.aggregation)
    }
}

const FOLDERS: &[SeriesFolder] = &[
    SeriesFolder {
        folder: "Q-Tagesmittel",
        quantity: Quantity::Discharge,
        resolution: Resolution::Daily,
        aggregation: Aggregation::Mean,
        unit: Unit::CubicMetresPerSecond,
        station_files: &[4, 5],
    },
    SeriesFolder {
        folder: "W-Tagesmittel",
        quantity: Quantity::Stage,
        resolution: Resolution::Daily,
        aggregation: Aggregation::Mean,
        unit: Unit::Centimetre,
        station_files: &[1, 2],
    },
    SeriesFolder {
        folder: "Q-Monatsmaxima",
        quantity: Quantity::Discharge,
        resolution: Resolution::Monthly,
        aggregation: Aggregation::Max,
        unit: Unit::CubicMetresPerSecond,
        station_files: &[7],
    },
    SeriesFolder {
        folder: "Q-Monatsminima",
        quantity: Quantity::Discharge,
        resolution: Resolution::Monthly,
        aggregation: Aggregation::Min,
        unit: Unit::CubicMetresPerSecond,
        station_files: &[6],
    },
    SeriesFolder {
        folder: "W-Monatsmaxima",
        quantity: Quantity::Stage,
        resolution: Resolution::Monthly,
        aggregation: Aggregation::Max,
        unit: Unit::Centimetre,
        station_files: &[4],
    },
    SeriesFolder {
        folder: "W-Monatsminima",
        quantity: Quantity::Stage,
        resolution: Resolution::Monthly,
        aggregation: Aggregation::Min,
        unit: Unit::Centimetre,
        station_files: &[3],
    },
    SeriesFolder {
        folder: "WT-Monatsmittel",
        quantity: Quantity::WaterTemperature,
        resolution: Resolution::Monthly,
        aggregation: Aggregation::Mean,
        unit: Unit::DegreesCelsius,
        station_files: &[9, 2, 5, 8],
    },
];

fn folder_for(variable: &Variable) -> Option<&'static SeriesFolder> {
    FOLDERS.iter().find(|f| f.variable() == *variable)
}

/// Decodes Latin-1 bytes.
fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn parse_row_time(date: &str, time: Option<&str>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date, "%d.%m.%Y").ok()?;
    let time = time
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok())
        .unwrap_or(NaiveTime::MIN);
    Some(NaiveDateTime::new(date, time).and_utc())
}

/// Reads the rows following the `Werte` marker, converted to SI.
///
/// Rows whose value is not a number (gaps are written as `Lücke`) are left
/// out. Returns `None` when the marker is missing.
fn parse_values(text: &str, folder: &SeriesFolder) -> Option<Vec<(DateTime<Utc>, f64)>> {
    let mut lines = text.lines();
    lines.by_ref().find(|l| l.trim_start().starts_with("Werte"))?;

    let mut values = Vec::new();
    for line in lines {
        let parts: Vec<&str> = FIELD_SEPARATOR.splitn(line.trim(), 3).collect();
        if parts.len() < 2 {
            continue;
        }
        let time = (parts.len() == 3).then(|| parts[1]);
        let Some(timestamp) = parse_row_time(parts[0], time) else {
            continue;
        };
        let Some(raw) = parts
            .last()
            .and_then(|v| v.trim().replace(',', ".").parse::<f64>().ok())
        else {
            continue;
        };
        let Ok(value) = convert(raw, folder.unit, folder.quantity) else {
            continue;
        };
        values.push((timestamp, value));
    }
    Some(values)
}

/// Station catalog entry inside the archive.
const CATALOG_FILE: &str = "messstellen_owf.csv";

/// Parses the `;`-separated catalog. Columns are located by header name.
fn parse_catalog(text: &str) -> Vec<StationMetadata> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<String> = header.split(';').map(unquote).collect();
    let column = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let Some(id_col) = column("hzbnr01") else {
        return Vec::new();
    };
    let (name, river, altitude, area, x, y) = (
        column("mstnam02"),
        column("gew03"),
        column("mpua04"),
        column("egarea05"),
        column("xrkko08"),
        column("yhkko09"),
    );

    lines
        .filter_map(|line| {
            let fields: Vec<String> = line.split(';').map(unquote).collect();
            let text = |col: Option<usize>| {
                col.and_then(|c| fields.get(c))
                    .filter(|v| !v.is_empty())
                    .cloned()
            };
            let number =
                |col: Option<usize>| text(col).and_then(|v| v.replace(',', ".").parse::<f64>().ok());
            let gauge_id = text(Some(id_col))?;
            let position = number(x)
                .zip(number(y))
                .and_then(|(easting, northing)| lambert_to_wgs84(easting, northing));
            Some(StationMetadata {
                name: text(name),
                river: text(river),
                latitude: position.map(|(lat, _)| lat),
                longitude: position.map(|(_, lon)| lon),
                altitude: number(altitude),
                area: number(area),
                country: Some("Austria".to_string()),
                source: Some("eHYD".to_string()),
                ..StationMetadata::new(gauge_id)
            })
        })
        .collect()
}

fn unquote(field: &str) -> String {
    field.trim().trim_matches('"').trim().to_string()
}

/// Bessel 1841, the MGI ellipsoid.
const BESSEL_A: f64 = 6_377_397.155;
const BESSEL_INV_F: f64 = 299.152_812_8;
/// WGS84 ellipsoid.
const WGS84_A: f64 = 6_378_137.0;
const WGS84_INV_F: f64 = 298.257_223_563;

/// MGI to WGS84 position-vector Helmert parameters (EPSG:1618): metres,
/// arc-seconds and parts per million.
const MGI_SHIFT: [f64; 3] = [577.326, 90.129, 463.919];
const MGI_ROTATION_ARCSEC: [f64; 3] = [5.137, 1.474, 5.297];
const MGI_SCALE_PPM: f64 = 2.4232;

/// Converts Austria Lambert (EPSG:31287) easting/northing to WGS84
/// `(latitude, longitude)` in degrees.
fn lambert_to_wgs84(easting: f64, northing: f64) -> Option<(f64, f64)> {
    let (phi, lambda) = austria_lambert_inverse(easting, northing)?;
    let (x, y, z) = geodetic_to_geocentric(phi, lambda, BESSEL_A, BESSEL_INV_F);

    let arcsec = (1.0_f64 / 3600.0).to_radians();
    let [tx, ty, tz] = MGI_SHIFT;
    let [rx, ry, rz] = MGI_ROTATION_ARCSEC.map(|r| r * arcsec);
    let scale = 1.0 + MGI_SCALE_PPM * 1e-6;
    let x2 = tx + scale * (x - rz * y + ry * z);
    let y2 = ty + scale * (rz * x + y - rx * z);
    let z2 = tz + scale * (-ry * x + rx * y + z);

    let (lat, lon) = geocentric_to_geodetic(x2, y2, z2, WGS84_A, WGS84_INV_F);
    (lat.is_finite() && lon.is_finite()).then(|| (lat.to_degrees(), lon.to_degrees()))
}

/// Inverse Lambert conformal conic (two standard parallels) for
/// EPSG:31287, returning Bessel latitude and longitude in radians.
fn austria_lambert_inverse(easting: f64, northing: f64) -> Option<(f64, f64)> {
    let (phi1, phi2, phi0) = (49.0_f64.to_radians(), 46.0_f64.to_radians(), 47.5_f64.to_radians());
    let lambda0 = (13.0_f64 + 20.0 / 60.0).to_radians();
    let (false_easting, false_northing) = (400_000.0, 400_000.0);

    let f = 1.0 / BESSEL_INV_F;
    let e2 = 2.0 * f - f * f;
    let e = e2.sqrt();
    let m = |phi: f64| phi.cos() / (1.0 - e2 * phi.sin().powi(2)).sqrt();
    let t = |phi: f64| {
        let s = e * phi.sin();
        (std::f64::consts::FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - s) / (1.0 + s)).powf(e / 2.0)
    };

    let n = (m(phi1).ln() - m(phi2).ln()) / (t(phi1).ln() - t(phi2).ln());
    let big_f = m(phi1) / (n * t(phi1).powf(n));
    let r0 = BESSEL_A * big_f * t(phi0).powf(n);

    let dx = easting - false_easting;
    let dy = r0 - (northing - false_northing);
    let r = dx.hypot(dy).copysign(n);
    if r.abs() < f64::EPSILON {
        return None;
    }
    let theta = dx.atan2(dy);
    let t_prime = (r / (BESSEL_A * big_f)).powf(1.0 / n);

    let mut phi = std::f64::consts::FRAC_PI_2 - 2.0 * t_prime.atan();
    for _ in 0..10 {
        let s = e * phi.sin();
        phi = std::f64::consts::FRAC_PI_2
            - 2.0 * (t_prime * ((1.0 - s) / (1.0 + s)).powf(e / 2.0)).atan();
    }
    Some((phi, theta / n + lambda0))
}

fn geodetic_to_geocentric(phi: f64, lambda: f64, a: f64, inv_f: f64) -> (f64, f64, f64) {
    let f = 1.0 / inv_f;
    let e2 = 2.0 * f - f * f;
    let nu = a / (1.0 - e2 * phi.sin().powi(2)).sqrt();
    (
        nu * phi.cos() * lambda.cos(),
        nu * phi.cos() * lambda.sin(),
        nu * (1.0 - e2) * phi.sin(),
    )
}

fn geocentric_to_geodetic(x: f64, y: f64, z: f64, a: f64, inv_f: f64) -> (f64, f64) {
    let f = 1.0 / inv_f;
    let e2 = 2.0 * f - f * f;
    let p = x.hypot(y);
    let mut phi = z.atan2(p * (1.0 - e2));
    for _ in 0..10 {
        let nu = a / (1.0 - e2 * phi.sin().powi(2)).sqrt();
        phi = (z + e2 * nu * phi.sin()).atan2(p);
    }
    (phi, y.atan2(x))
}

/// Turns archive entries into cache rows and the station catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct EhydDecoder;

impl ArchiveDecoder for EhydDecoder {
    fn decode_entry(&self, name: &str, bytes: &[u8]) -> Result<Vec<CacheRow>, CacheError> {
        let Some(folder) = FOLDERS
            .iter()
            .find(|f| name.split('/').any(|part| part == f.folder))
        else {
            return Ok(Vec::new());
        };
        let Some(gauge_id) = STATION_FILE.captures(name).and_then(|c| c.get(1)) else {
            return Ok(Vec::new());
        };

        let values = parse_values(&latin1(bytes), folder)
            .ok_or_else(|| CacheError::decode(name, "no `Werte` marker"))?;
        let variable = folder.variable();
        Ok(values
            .into_iter()
            .map(|(timestamp, value)| CacheRow {
                gauge_id: gauge_id.as_str().to_string(),
                variable: variable.clone(),
                timestamp,
                value: Some(value),
            })
            .collect())
    }

    fn decode_stations(
        &self,
        name: &str,
        bytes: &[u8],
    ) -> Result<Vec<StationMetadata>, CacheError> {
        if !name.ends_with(CATALOG_FILE) {
            return Ok(Vec::new());
        }
        let stations = parse_catalog(&latin1(bytes));
        if stations.is_empty() {
            return Err(CacheError::decode(name, "no station rows"));
        }
        Ok(stations)
    }
}

/// eHYD adapter.
pub struct AustriaProvider {
    base_url: String,
    client: HttpClient,
    engine: AcquisitionEngine,
    cache_dir: PathBuf,
    cache: OnceCell<BulkCache>,
    variables: VariableSet,
}

impl std::fmt::Debug for AustriaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AustriaProvider")
            .field("base_url", &self.base_url)
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl AustriaProvider {
    /// Creates the adapter. The cache database is opened on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = http_client(config, READ_TIMEOUT_SECS)?;
        let triples: Vec<_> = FOLDERS
            .iter()
            .map(|f| (f.quantity, f.resolution, f.aggregation))
            .collect();
        Ok(Self {
            base_url: config.base_url_or(DEFAULT_BASE_URL),
            engine: AcquisitionEngine::new(client.clone(), rate_limiter(config, None)),
            client,
            cache_dir: config.cache_dir.clone(),
            cache: OnceCell::new(),
            variables: variable_set(&triples),
        })
    }

    /// Request for the full archive.
    #[must_use]
    pub fn archive_request(&self) -> HttpRequest {
        HttpRequest::new(format!("{}/AreaSelection/download", self.base_url))
            .param("cat", "owf")
            .param("reg", "10")
    }

    /// The bulk cache, opening its database on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Cache`] if the cache directory or database
    /// cannot be opened.
    pub async fn bulk_cache(&self) -> Result<&BulkCache, ProviderError> {
        let cache = self
            .cache
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.cache_dir)
                    .await
                    .map_err(|e| CacheError::io(&self.cache_dir, e))?;
                let store = BulkStore::new(&self.cache_dir.join(CACHE_FILE)).await?;
                Ok::<_, CacheError>(
                    BulkCache::new(
                        NAME,
                        self.archive_request(),
                        self.client.clone(),
                        store,
                        Arc::new(EhydDecoder),
                    )
                    .with_staging_dir(&self.cache_dir),
                )
            })
            .await?;
        Ok(cache)
    }

    /// Downloads one station's file for `folder` from the per-station
    /// export, trying each candidate file number in turn.
    #[instrument(skip(self, folder), fields(folder = folder.folder))]
    async fn fetch_station_file(&self, gauge_id: &str, folder: &SeriesFolder) -> Option<String> {
        let candidates = CandidateList::new(folder.station_files.iter().copied());
        let hit = candidates
            .first_match(|file| {
                let request = HttpRequest::new(format!("{}/MessstellenExtraData/owf", self.base_url))
                    .param("id", gauge_id)
                    .param("file", file.to_string());
                async move {
                    let response = match self.engine.fetch(request, false).await {
                        Ok(response) => response,
                        Err(error) => {
                            debug!(error = %error, "station file candidate failed");
                            return None;
                        }
                    };
                    let disposition = response.header("content-disposition").unwrap_or_default();
                    disposition
                        .contains(folder.folder)
                        .then(|| latin1(response.bytes()))
                }
            })
            .await;
        hit.map(|(_, text)| text)
    }
}

#[async_trait]
impl Provider for AustriaProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn available_variables(&self) -> &VariableSet {
        &self.variables
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::First
    }

    async fn build_cache(&self) -> Result<Option<BuildOutcome>, ProviderError> {
        Ok(Some(self.bulk_cache().await?.build().await?))
    }

    /// The catalog stored with the bulk cache, building it if needed.
    #[instrument(skip(self))]
    async fn metadata(&self) -> Result<Option<Vec<StationMetadata>>, ProviderError> {
        let stations = self.bulk_cache().await?.stations().await?;
        debug!(stations = stations.len(), "station catalog read from bulk cache");
        Ok(Some(stations))
    }

    async fn download(
        &self,
        gauge_id: &str,
        variable: &Variable,
        window: DateWindow,
    ) -> Result<RawData, ProviderError> {
        let folder =
            folder_for(variable).ok_or_else(|| ProviderError::parse(NAME, "unsupported variable"))?;

        match self.bulk_cache().await {
            Ok(cache) => match cache.lookup(gauge_id, variable, window.start, window.end).await {
                Ok(Some(observations)) => return Ok(RawData::Observations(observations)),
                Ok(None) => info!(gauge_id, "series not in bulk archive, trying station export"),
                Err(error) => warn!(error = %error, "bulk cache unavailable, trying station export"),
            },
            Err(error) => warn!(error = %error, "bulk cache unavailable, trying station export"),
        }

        let Some(text) = self.fetch_station_file(gauge_id, folder).await else {
            return Ok(RawData::Observations(Vec::new()));
        };
        let values = parse_values(&text, folder)
            .ok_or_else(|| ProviderError::parse(gauge_id, "no `Werte` marker in station file"))?;
        Ok(RawData::Observations(
            values
                .into_iter()
                .map(|(timestamp, value)| Observation::new(timestamp, Some(value)))
                .collect(),
        ))
    }

    /// Archive data arrives decoded; there are no pages to parse.
    fn parse_chunk(
        &self,
        _gauge_id: &str,
        page: &RawPage,
        _variable: &Variable,
    ) -> Result<Vec<Observation>, ProviderError> {
        Err(ProviderError::parse(&page.url, "eHYD data is served from the bulk cache"))
    }
}
