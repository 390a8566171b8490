//! Agency adapters and the default registry.
//!
//! | Name | Agency | Access |
//! |------|--------|--------|
//! | `austria` | eHYD | bulk ZIP archive, cached locally |
//! | `czech` | CHMI open data | one JSON file per year |
//! | `france` | Hub'Eau | paginated JSON API |
//! | `lithuania` | Meteo.lt | one JSON request per month |
//! | `norway` | NVE `HydAPI` | JSON API behind an API key |
//! | `southafrica` | DWS | scraped text tables |

pub mod austria;
pub mod czech;
pub mod france;
pub mod lithuania;
pub mod norway;
pub mod southafrica;

use std::sync::Arc;

use tracing::{info, warn};

pub use austria::AustriaProvider;
pub use czech::CzechProvider;
pub use france::FranceProvider;
pub use lithuania::LithuaniaProvider;
pub use norway::NorwayProvider;
pub use southafrica::SouthAfricaProvider;

use super::{Provider, ProviderError, ProviderRegistry};
use crate::config::{Config, ProviderConfig};
use crate::rate_limit::RateLimiter;
use crate::transport::HttpClient;
use crate::variable::{Unit, Variable, convert};

/// Names of every built-in adapter, sorted.
pub const PROVIDER_NAMES: &[&str] = &[
    austria::NAME,
    czech::NAME,
    france::NAME,
    lithuania::NAME,
    norway::NAME,
    southafrica::NAME,
];

/// Builds a registry holding every adapter that can run with `config`.
///
/// Adapters that fail to construct or lack required credentials are left
/// out with a warning.
#[must_use]
pub fn build_default_registry(config: &Config) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    register(&mut registry, AustriaProvider::new(&config.provider(austria::NAME)));
    register(&mut registry, CzechProvider::new(&config.provider(czech::NAME)));
    register(&mut registry, FranceProvider::new(&config.provider(france::NAME)));
    register(&mut registry, LithuaniaProvider::new(&config.provider(lithuania::NAME)));
    register(&mut registry, NorwayProvider::new(&config.provider(norway::NAME)));
    register(
        &mut registry,
        SouthAfricaProvider::new(&config.provider(southafrica::NAME)),
    );

    info!(providers = registry.len(), "default registry built");
    registry
}

fn register<P: Provider + 'static>(
    registry: &mut ProviderRegistry,
    adapter: Result<P, ProviderError>,
) {
    match adapter {
        Ok(adapter) if adapter.credentials_missing() => warn!(
            provider = adapter.name(),
            "credentials not configured; provider disabled"
        ),
        Ok(adapter) => registry.register(Arc::new(adapter)),
        Err(error) => warn!(
            error = %error,
            "provider unavailable; continuing with remaining providers"
        ),
    }
}

/// HTTP client honoring the configured timeouts.
pub(crate) fn http_client(
    config: &ProviderConfig,
    default_read_secs: u64,
) -> Result<HttpClient, ProviderError> {
    Ok(HttpClient::new(
        config.connect_timeout_secs,
        config.read_timeout_or(default_read_secs),
    )?)
}

/// Limiter honoring the configured cap; `None` leaves the agency unthrottled.
pub(crate) fn rate_limiter(config: &ProviderConfig, default_per_minute: Option<usize>) -> Arc<RateLimiter> {
    let limiter = match config.rate_limit_per_minute.or(default_per_minute) {
        Some(cap) => RateLimiter::per_minute(cap),
        None => RateLimiter::disabled(),
    };
    Arc::new(limiter)
}

/// Reads a JSON number, or a string holding one.
pub(crate) fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Converts an optional raw value into `variable`'s SI unit.
pub(crate) fn to_si(
    value: Option<f64>,
    unit: Unit,
    variable: &Variable,
) -> Result<Option<f64>, ProviderError> {
    value
        .map(|v| convert(v, unit, variable.quantity()))
        .transpose()
        .map_err(ProviderError::from)
}
