//! Runtime configuration.
//!
//! [`Config`] collects the settings shared by every provider (cache and
//! snapshot directories, concurrency, HTTP timeouts) together with each
//! provider's credentials and base URL override. It is read from the
//! environment with [`Config::from_env`] and then adjusted by CLI flags.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `HYDROFETCH_CACHE_DIR` | bulk cache directory |
//! | `HYDROFETCH_SNAPSHOT_DIR` | directory of `<provider>.json` metadata snapshots |
//! | `HYDROFETCH_CONCURRENCY` | batch worker count (1..=100) |
//! | `HYDROFETCH_CONNECT_TIMEOUT` | connect timeout in seconds (1..=3600) |
//! | `HYDROFETCH_READ_TIMEOUT` | read timeout in seconds (1..=3600) |
//! | `HYDROFETCH_<PROVIDER>_API_KEY` | static API key |
//! | `HYDROFETCH_<PROVIDER>_USERNAME` / `_PASSWORD` | login credentials |
//! | `HYDROFETCH_<PROVIDER>_BASE_URL` | endpoint override |

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::Credentials;
use crate::transport::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HYDROFETCH";

/// Default bulk cache directory.
pub const DEFAULT_CACHE_DIR: &str = ".hydrofetch-cache";

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrency.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Maximum allowed timeout in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable holds a value that does not parse.
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// Concurrency outside the allowed range.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Timeout outside the allowed range.
    #[error("invalid {name} {value}s: must be between 1 and {MAX_TIMEOUT_SECS} seconds")]
    InvalidTimeout {
        /// Which timeout.
        name: &'static str,
        /// The invalid value.
        value: u64,
    },

    /// Only one half of a username/password pair was set.
    #[error("incomplete login for {provider}: both username and password are required")]
    IncompleteLogin {
        /// Provider name.
        provider: String,
    },
}

impl ConfigError {
    fn invalid_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Settings for one provider, injected into its adapter constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Replaces the agency's default endpoint (tests, mirrors).
    pub base_url: Option<String>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds; adapters may raise it for slow endpoints.
    pub read_timeout_secs: Option<u64>,
    /// Overrides the adapter's requests-per-minute cap.
    pub rate_limit_per_minute: Option<usize>,
    /// Credentials, when the agency needs them.
    pub credentials: Option<Credentials>,
    /// Directory for bulk caches.
    pub cache_dir: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: None,
            rate_limit_per_minute: None,
            credentials: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

impl ProviderConfig {
    /// Resolves the endpoint: the override if set, else `default`.
    #[must_use]
    pub fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    /// Resolves the read timeout: the override if set, else `default`.
    #[must_use]
    pub fn read_timeout_or(&self, default: u64) -> u64 {
        self.read_timeout_secs.unwrap_or(default)
    }

    /// Resolves the rate cap: the override if set, else `default`.
    #[must_use]
    pub fn rate_limit_or(&self, default: usize) -> usize {
        self.rate_limit_per_minute.unwrap_or(default)
    }

    /// The API key, if the credentials are one.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        match &self.credentials {
            Some(Credentials::ApiKey(key)) => Some(key),
            _ => None,
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory for bulk caches.
    pub cache_dir: PathBuf,
    /// Directory holding `<provider>.json` metadata snapshots.
    pub snapshot_dir: Option<PathBuf>,
    /// Batch worker count.
    pub concurrency: usize,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds; `None` keeps each adapter's own default.
    pub read_timeout_secs: Option<u64>,
    credentials: HashMap<String, Credentials>,
    base_urls: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            snapshot_dir: None,
            concurrency: DEFAULT_CONCURRENCY,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: None,
            credentials: HashMap::new(),
            base_urls: HashMap::new(),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// `providers` lists the names whose credential and base URL variables
    /// are looked up.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a variable does not parse or a value is
    /// out of range.
    pub fn from_env(providers: &[&str]) -> Result<Self, ConfigError> {
        Self::from_lookup(providers, |name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup` instead of the environment.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup(
        providers: &[&str],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}_{suffix}");
            lookup(&name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (name, v))
        };

        let mut config = Config::default();
        if let Some((_, dir)) = var("CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some((_, dir)) = var("SNAPSHOT_DIR") {
            config.snapshot_dir = Some(PathBuf::from(dir));
        }
        if let Some((name, value)) = var("CONCURRENCY") {
            config.concurrency = value
                .parse()
                .map_err(|_| ConfigError::invalid_value(&name, &value))?;
        }
        if let Some((name, value)) = var("CONNECT_TIMEOUT") {
            config.connect_timeout_secs = value
                .parse()
                .map_err(|_| ConfigError::invalid_value(&name, &value))?;
        }
        if let Some((name, value)) = var("READ_TIMEOUT") {
            config.read_timeout_secs = Some(
                value
                    .parse()
                    .map_err(|_| ConfigError::invalid_value(&name, &value))?,
            );
        }

        for provider in providers {
            let key = provider.to_ascii_uppercase();
            if let Some((_, api_key)) = var(&format!("{key}_API_KEY")) {
                config.set_credentials(provider, Credentials::ApiKey(api_key));
            } else {
                match (var(&format!("{key}_USERNAME")), var(&format!("{key}_PASSWORD"))) {
                    (Some((_, username)), Some((_, password))) => {
                        config.set_credentials(provider, Credentials::Login { username, password });
                    }
                    (None, None) => {}
                    _ => {
                        return Err(ConfigError::IncompleteLogin {
                            provider: (*provider).to_string(),
                        });
                    }
                }
            }
            if let Some((_, url)) = var(&format!("{key}_BASE_URL")) {
                config.set_base_url(provider, url);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConcurrency`] or
    /// [`ConfigError::InvalidTimeout`] for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.concurrency,
            });
        }
        validate_timeout("connect timeout", self.connect_timeout_secs)?;
        if let Some(read) = self.read_timeout_secs {
            validate_timeout("read timeout", read)?;
        }
        Ok(())
    }

    /// Sets credentials for `provider`.
    pub fn set_credentials(&mut self, provider: &str, credentials: Credentials) {
        self.credentials.insert(provider.to_string(), credentials);
    }

    /// Sets the endpoint override for `provider`.
    pub fn set_base_url(&mut self, provider: &str, url: impl Into<String>) {
        self.base_urls.insert(provider.to_string(), url.into());
    }

    /// Credentials configured for `provider`.
    #[must_use]
    pub fn credentials(&self, provider: &str) -> Option<&Credentials> {
        self.credentials.get(provider)
    }

    /// Settings to hand to `provider`'s adapter.
    #[must_use]
    pub fn provider(&self, provider: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: self.base_urls.get(provider).cloned(),
            connect_timeout_secs: self.connect_timeout_secs,
            read_timeout_secs: self.read_timeout_secs,
            rate_limit_per_minute: None,
            credentials: self.credentials.get(provider).cloned(),
            cache_dir: self.cache_dir.clone(),
        }
    }

    /// Location of `provider`'s metadata snapshot, when a snapshot directory
    /// is configured.
    #[must_use]
    pub fn snapshot_path(&self, provider: &str) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("{provider}.json")))
    }
}

fn validate_timeout(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=MAX_TIMEOUT_SECS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidTimeout { name, value })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = Config::from_lookup(&["norway"], |_| None).unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.cache_dir, PathBuf::from(".hydrofetch-cache"));
        assert_eq!(config.connect_timeout_secs, 30);
        assert!(config.read_timeout_secs.is_none());
        assert!(config.credentials("norway").is_none());
    }

    #[test]
    fn test_reads_settings_and_credentials() {
        let config = Config::from_lookup(
            &["norway", "lithuania"],
            lookup_from(&[
                ("HYDROFETCH_CONCURRENCY", "8"),
                ("HYDROFETCH_READ_TIMEOUT", "120"),
                ("HYDROFETCH_CACHE_DIR", "/var/cache/hf"),
                ("HYDROFETCH_NORWAY_API_KEY", "abc"),
                ("HYDROFETCH_LITHUANIA_BASE_URL", "http://localhost:9000/"),
            ]),
        )
        .unwrap();

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.read_timeout_secs, Some(120));
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/hf"));
        assert_eq!(
            config.credentials("norway"),
            Some(&Credentials::ApiKey("abc".to_string()))
        );
        let lithuania = config.provider("lithuania");
        assert_eq!(
            lithuania.base_url_or("https://api.meteo.lt/v1"),
            "http://localhost:9000"
        );
        assert!(lithuania.credentials.is_none());
    }

    #[test]
    fn test_login_pair_required() {
        let err = Config::from_lookup(
            &["acme"],
            lookup_from(&[("HYDROFETCH_ACME_USERNAME", "user")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteLogin { .. }));

        let config = Config::from_lookup(
            &["acme"],
            lookup_from(&[
                ("HYDROFETCH_ACME_USERNAME", "user"),
                ("HYDROFETCH_ACME_PASSWORD", "pw"),
            ]),
        )
        .unwrap();
        assert!(matches!(
            config.credentials("acme"),
            Some(Credentials::Login { .. })
        ));
    }

    #[test]
    fn test_concurrency_out_of_range_rejected() {
        for value in ["0", "101"] {
            let err = Config::from_lookup(&[], lookup_from(&[("HYDROFETCH_CONCURRENCY", value)]))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidConcurrency { .. }));
        }
    }

    #[test]
    fn test_unparsable_value_rejected() {
        let err = Config::from_lookup(&[], lookup_from(&[("HYDROFETCH_CONCURRENCY", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "HYDROFETCH_CONCURRENCY".to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn test_timeout_out_of_range_rejected() {
        let err = Config::from_lookup(&[], lookup_from(&[("HYDROFETCH_CONNECT_TIMEOUT", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimeout { .. }));
    }

    #[test]
    fn test_snapshot_path() {
        let mut config = Config::default();
        assert!(config.snapshot_path("czech").is_none());
        config.snapshot_dir = Some(PathBuf::from("/snapshots"));
        assert_eq!(
            config.snapshot_path("czech"),
            Some(PathBuf::from("/snapshots/czech.json"))
        );
    }

    #[test]
    fn test_provider_config_fallbacks() {
        let provider = ProviderConfig::default();
        assert_eq!(provider.read_timeout_or(300), 300);
        assert_eq!(provider.rate_limit_or(180), 180);
        assert!(provider.api_key().is_none());
    }
}
