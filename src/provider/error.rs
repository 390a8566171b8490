//! Error types for provider adapters and `get_data`.

use thiserror::Error;

use crate::cache::CacheError;
use crate::session::AuthError;
use crate::transport::TransportError;
use crate::variable::CatalogError;

/// Failures inside an adapter's download or parse step.
///
/// These never reach `get_data` callers: they are logged and the affected
/// chunk (or the whole result) comes back empty.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Request failed after retries.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Token exchange failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Bulk cache build or query failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A payload could not be parsed.
    #[error("failed to parse {context}: {reason}")]
    Parse {
        /// What was being parsed (URL, entry name, field).
        context: String,
        /// What went wrong.
        reason: String,
    },

    /// A value carried a unit that cannot express the variable.
    #[error(transparent)]
    Unit(#[from] CatalogError),
}

impl ProviderError {
    /// Creates a parse error.
    pub fn parse(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            reason: reason.into(),
        }
    }
}

/// Request errors reported synchronously by `get_data` and the registry.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The variable exists but this provider does not serve it.
    #[error("provider {provider} does not support variable {variable}")]
    UnsupportedVariable {
        /// Provider name.
        provider: String,
        /// Requested variable identifier.
        variable: String,
    },

    /// The variable identifier is not part of the catalog.
    #[error("unknown variable: {0}")]
    UnknownVariable(#[from] CatalogError),

    /// A date is not `YYYY-MM-DD`.
    #[error("invalid date {value:?}: expected YYYY-MM-DD")]
    InvalidDate {
        /// Offending input.
        value: String,
    },

    /// Start date after end date.
    #[error("start date {start} is after end date {end}")]
    InvalidRange {
        /// Requested start.
        start: chrono::NaiveDate,
        /// Requested end.
        end: chrono::NaiveDate,
    },

    /// No provider registered under that name.
    #[error("unknown provider: {name}")]
    UnknownProvider {
        /// Requested name.
        name: String,
    },

    /// The provider needs credentials that were not configured.
    #[error("provider {provider} requires credentials (set HYDROFETCH_{env}_API_KEY or _USERNAME/_PASSWORD)", env = .provider.to_ascii_uppercase())]
    MissingCredentials {
        /// Provider name.
        provider: String,
    },
}

impl FetchError {
    /// Creates an unsupported-variable error.
    pub fn unsupported(provider: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::UnsupportedVariable {
            provider: provider.into(),
            variable: variable.into(),
        }
    }

    /// Creates an invalid-date error.
    pub fn invalid_date(value: impl Into<String>) -> Self {
        Self::InvalidDate {
            value: value.into(),
        }
    }

    /// Creates an unknown-provider error.
    pub fn unknown_provider(name: impl Into<String>) -> Self {
        Self::UnknownProvider { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credentials_names_env_vars() {
        let err = FetchError::MissingCredentials {
            provider: "norway".to_string(),
        };
        assert!(err.to_string().contains("HYDROFETCH_NORWAY_API_KEY"));
    }

    #[test]
    fn test_parse_error_display() {
        let err = ProviderError::parse("page 3", "missing field `data`");
        assert_eq!(err.to_string(), "failed to parse page 3: missing field `data`");
    }
}
