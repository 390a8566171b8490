//! Provider adapter contract and the `get_data` entry point.
//!
//! Every agency integration implements [`Provider`]: it declares the
//! variables it serves, downloads raw payloads for a date window, and turns
//! each payload into observations. [`get_data`] wraps any provider with the
//! shared request validation, defaulting, error containment and clipping, so
//! adapters only deal with their own wire format.
//!
//! # Example
//!
//! ```no_run
//! use hydrofetch_core::config::Config;
//! use hydrofetch_core::provider::build_default_registry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = build_default_registry(&Config::default());
//! let series = registry
//!     .get_data("lithuania", "1", "discharge-daily-mean", Some("2020-01-01"), Some("2020-12-31"))
//!     .await?;
//! print!("{}", series.to_csv());
//! # Ok(())
//! # }
//! ```

pub mod agencies;
mod candidates;
mod error;
mod registry;

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures_util::FutureExt;
use tracing::{debug, info, instrument, warn};

pub use crate::acquisition::{DateWindow, RawData, RawPage};
pub use agencies::build_default_registry;
pub use candidates::CandidateList;
pub use error::{FetchError, ProviderError};
pub use registry::ProviderRegistry;

use crate::cache::BuildOutcome;
use crate::series::{CanonicalTimeSeries, MergePolicy, Observation, StationMetadata};
use crate::variable::{Variable, VariableSet};

/// Default start of a request when the caller gives none.
pub const DEFAULT_START: NaiveDate = match NaiveDate::from_ymd_opt(1900, 1, 1) {
    Some(date) => date,
    None => NaiveDate::MIN,
};

/// An agency integration.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name (lowercase, e.g. `"lithuania"`).
    fn name(&self) -> &str;

    /// Variables this provider serves.
    fn available_variables(&self) -> &VariableSet;

    /// How observations sharing a timestamp are collapsed.
    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::Last
    }

    /// Start date used when the caller gives none.
    fn default_start(&self) -> NaiveDate {
        DEFAULT_START
    }

    /// Whether the provider needs credentials it does not have.
    fn credentials_missing(&self) -> bool {
        false
    }

    /// Live station catalog. `Ok(None)` means the agency publishes none.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the catalog request or parse fails.
    async fn metadata(&self) -> Result<Option<Vec<StationMetadata>>, ProviderError> {
        Ok(None)
    }

    /// Builds the provider's bulk cache. `Ok(None)` means the provider reads
    /// a live API and keeps no cache.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Cache`] when the build fails.
    async fn build_cache(&self) -> Result<Option<BuildOutcome>, ProviderError> {
        Ok(None)
    }

    /// Downloads everything needed for `gauge_id` and `variable` within
    /// `window`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] for failures that leave nothing usable.
    async fn download(
        &self,
        gauge_id: &str,
        variable: &Variable,
        window: DateWindow,
    ) -> Result<RawData, ProviderError>;

    /// Parses one payload into SI observations.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Parse`] when the payload is unreadable.
    fn parse_chunk(
        &self,
        gauge_id: &str,
        page: &RawPage,
        variable: &Variable,
    ) -> Result<Vec<Observation>, ProviderError>;

    /// Parses every payload and builds the canonical series.
    ///
    /// Payloads that fail to parse are logged and left out.
    fn parse(&self, gauge_id: &str, raw: RawData, variable: &Variable) -> CanonicalTimeSeries {
        let observations = match raw {
            RawData::Observations(observations) => observations,
            RawData::Pages(pages) => {
                let mut observations = Vec::new();
                for page in &pages {
                    match self.parse_chunk(gauge_id, page, variable) {
                        Ok(parsed) => observations.extend(parsed),
                        Err(error) => warn!(
                            provider = self.name(),
                            gauge_id,
                            window = %page.window,
                            page = page.page,
                            error = %error,
                            "skipping unparsable chunk"
                        ),
                    }
                }
                observations
            }
        };
        CanonicalTimeSeries::from_observations(
            gauge_id,
            variable.clone(),
            observations,
            self.merge_policy(),
        )
    }
}

/// Parses a `YYYY-MM-DD` request date.
///
/// # Errors
///
/// Returns [`FetchError::InvalidDate`] for any other shape.
pub fn parse_request_date(value: &str) -> Result<NaiveDate, FetchError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| FetchError::invalid_date(value))
}

/// Checks a request against `provider` and resolves its dates.
///
/// # Errors
///
/// Returns the [`FetchError`] configuration kind for an unknown or
/// unsupported variable, a malformed date, a reversed range, or missing
/// credentials.
pub fn validate_request(
    provider: &dyn Provider,
    variable_id: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(Variable, DateWindow), FetchError> {
    let variable: Variable = variable_id.parse()?;
    if !provider.available_variables().contains(&variable) {
        return Err(FetchError::unsupported(provider.name(), variable_id));
    }
    if provider.credentials_missing() {
        return Err(FetchError::MissingCredentials {
            provider: provider.name().to_string(),
        });
    }

    let start = start
        .map(parse_request_date)
        .transpose()?
        .unwrap_or_else(|| provider.default_start());
    let end = end
        .map(parse_request_date)
        .transpose()?
        .unwrap_or_else(|| Utc::now().date_naive());
    if start > end {
        return Err(FetchError::InvalidRange { start, end });
    }
    Ok((variable, DateWindow::new(start, end)))
}

/// Fetches one canonical series from `provider`.
///
/// Dates are `YYYY-MM-DD`; a missing start defaults to the provider's
/// [`Provider::default_start`] and a missing end to today (UTC). The result
/// is sorted, deduplicated, in SI units and clipped to the closed range.
///
/// Data unavailability is not an error: download and parse failures, and
/// panics inside the adapter, are logged and yield an empty series.
///
/// # Errors
///
/// Returns [`FetchError`] only for invalid requests (see [`validate_request`]).
#[instrument(skip(provider), fields(provider = provider.name()))]
pub async fn get_data(
    provider: &dyn Provider,
    gauge_id: &str,
    variable_id: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<CanonicalTimeSeries, FetchError> {
    let (variable, window) = validate_request(provider, variable_id, start, end)?;
    debug!(window = %window, "request validated");

    let download = AssertUnwindSafe(provider.download(gauge_id, &variable, window))
        .catch_unwind()
        .await;
    let raw = match download {
        Ok(Ok(raw)) => raw,
        Ok(Err(error)) => {
            warn!(gauge_id, error = %error, "download failed, returning empty series");
            return Ok(CanonicalTimeSeries::empty(gauge_id, variable));
        }
        Err(_) => {
            warn!(gauge_id, "download panicked, returning empty series");
            return Ok(CanonicalTimeSeries::empty(gauge_id, variable));
        }
    };

    let parsed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        provider.parse(gauge_id, raw, &variable)
    }));
    let series = match parsed {
        Ok(series) => series.clip(window.start, window.end),
        Err(_) => {
            warn!(gauge_id, "parse panicked, returning empty series");
            CanonicalTimeSeries::empty(gauge_id, variable)
        }
    };

    info!(gauge_id, observations = series.len(), "series ready");
    Ok(series)
}
