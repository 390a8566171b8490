//! Hydrofetch Core Library
//!
//! Retrieves river gauge time series from national hydrological agencies and
//! returns them in one canonical shape: ascending, de-duplicated UTC
//! timestamps, a single named value column, SI units.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`variable`] - Variable catalog and unit conversion
//! - [`series`] - Canonical time series and station metadata records
//! - [`transport`] - HTTP client with retry and backoff
//! - [`session`] - Credential exchange and token caching
//! - [`rate_limit`] - Sliding-window per-host request caps
//! - [`acquisition`] - Date windowing and page walking
//! - [`cache`] - Bulk archive cache on SQLite
//! - [`provider`] - Adapter contract, `get_data`, agency adapters
//! - [`metadata`] - Station catalogs with snapshot fallback
//! - [`batch`] - Bounded worker pool for many requests
//! - [`config`] - Environment and per-provider settings

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acquisition;
pub mod batch;
pub mod cache;
pub mod config;
pub mod metadata;
pub mod provider;
pub mod rate_limit;
pub mod series;
pub mod session;
pub mod transport;
pub mod variable;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use batch::{
    BatchError, BatchObserver, BatchReport, BatchRunner, BatchStats, FetchTask, NoopObserver,
    TaskOutcome,
};
pub use cache::{BuildOutcome, BulkCache, BulkStore, CacheError};
pub use config::{Config, ConfigError, DEFAULT_CONCURRENCY, ProviderConfig};
pub use metadata::{Catalog, MetadataError, MetadataResolver, write_snapshot};
pub use provider::agencies::PROVIDER_NAMES;
pub use provider::{
    FetchError, Provider, ProviderError, ProviderRegistry, build_default_registry, get_data,
};
pub use rate_limit::RateLimiter;
pub use series::{CanonicalTimeSeries, MergePolicy, Observation, StationMetadata};
pub use session::{AuthError, AuthSession, Credentials};
pub use transport::{HttpClient, RetryPolicy, TransportError};
pub use variable::{CatalogError, Quantity, Resolution, Unit, Variable, VariableSet};
