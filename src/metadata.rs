//! Station catalogs with snapshot fallback.
//!
//! [`MetadataResolver`] asks the provider for its live catalog and, when the
//! agency publishes none or the request fails, reads a JSON snapshot of
//! [`StationMetadata`] records instead. The first successful answer is kept
//! for the resolver's lifetime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::provider::{Provider, ProviderError};
use crate::series::StationMetadata;

/// Errors raised while resolving a catalog.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The live catalog failed and no snapshot was available.
    #[error("live catalog unavailable and no snapshot configured: {0}")]
    Live(#[source] ProviderError),

    /// The snapshot file could not be read or written.
    #[error("snapshot IO error at {path}: {source}")]
    SnapshotIo {
        /// Snapshot location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file is not a JSON array of station records.
    #[error("malformed snapshot {path}: {source}")]
    SnapshotFormat {
        /// Snapshot location.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Where a catalog came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Catalog {
    /// Fetched from the agency just now.
    Live(Vec<StationMetadata>),
    /// Read from a snapshot file.
    Snapshot(Vec<StationMetadata>),
    /// The agency publishes no catalog and no snapshot exists.
    Unsupported,
}

impl Catalog {
    /// Station records; empty when unsupported.
    #[must_use]
    pub fn stations(&self) -> &[StationMetadata] {
        match self {
            Catalog::Live(stations) | Catalog::Snapshot(stations) => stations,
            Catalog::Unsupported => &[],
        }
    }

    /// Looks up one gauge.
    #[must_use]
    pub fn find(&self, gauge_id: &str) -> Option<&StationMetadata> {
        self.stations().iter().find(|s| s.gauge_id == gauge_id)
    }

    /// Short label for the catalog's origin.
    #[must_use]
    pub fn origin(&self) -> &'static str {
        match self {
            Catalog::Live(_) => "live",
            Catalog::Snapshot(_) => "snapshot",
            Catalog::Unsupported => "unsupported",
        }
    }
}

/// Resolves and caches one provider's station catalog.
pub struct MetadataResolver {
    provider: Arc<dyn Provider>,
    snapshot: Option<PathBuf>,
    catalog: OnceCell<Catalog>,
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver")
            .field("provider", &self.provider.name())
            .field("snapshot", &self.snapshot)
            .field("resolved", &self.catalog.initialized())
            .finish()
    }
}

impl MetadataResolver {
    /// Creates a resolver; `snapshot` is the fallback JSON file, if any.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, snapshot: Option<PathBuf>) -> Self {
        Self {
            provider,
            snapshot,
            catalog: OnceCell::new(),
        }
    }

    /// The provider's catalog, resolved on first call.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Live`] when the live catalog fails and no
    /// snapshot exists, or a snapshot error when the snapshot is unreadable.
    /// Failures are not cached; the next call tries again.
    #[instrument(skip(self), fields(provider = self.provider.name()))]
    pub async fn metadata(&self) -> Result<&Catalog, MetadataError> {
        self.catalog.get_or_try_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Result<Catalog, MetadataError> {
        match self.provider.metadata().await {
            Ok(Some(stations)) => {
                info!(stations = stations.len(), "live catalog fetched");
                Ok(Catalog::Live(stations))
            }
            Ok(None) => {
                debug!("provider publishes no live catalog");
                Ok(self
                    .read_snapshot()
                    .await?
                    .map_or(Catalog::Unsupported, Catalog::Snapshot))
            }
            Err(error) => {
                warn!(error = %error, "live catalog failed, trying snapshot");
                match self.read_snapshot().await? {
                    Some(stations) => Ok(Catalog::Snapshot(stations)),
                    None => Err(MetadataError::Live(error)),
                }
            }
        }
    }

    async fn read_snapshot(&self) -> Result<Option<Vec<StationMetadata>>, MetadataError> {
        let Some(path) = &self.snapshot else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot file");
                return Ok(None);
            }
            Err(source) => {
                return Err(MetadataError::SnapshotIo {
                    path: path.clone(),
                    source,
                });
            }
        };
        let stations: Vec<StationMetadata> =
            serde_json::from_slice(&bytes).map_err(|source| MetadataError::SnapshotFormat {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), stations = stations.len(), "snapshot loaded");
        Ok(Some(stations))
    }
}

/// Writes `stations` as a pretty-printed JSON snapshot, creating parent
/// directories as needed.
///
/// # Errors
///
/// Returns [`MetadataError::SnapshotIo`] if the file cannot be written.
pub async fn write_snapshot(path: &Path, stations: &[StationMetadata]) -> Result<(), MetadataError> {
    let io_err = |source| MetadataError::SnapshotIo {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let json = serde_json::to_vec_pretty(stations).map_err(|source| MetadataError::SnapshotFormat {
        path: path.to_path_buf(),
        source,
    })?;
    tokio::fs::write(path, json).await.map_err(io_err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::provider::{DateWindow, RawData, RawPage};
    use crate::series::Observation;
    use crate::variable::{Variable, VariableSet};

    enum Live {
        Stations,
        Unsupported,
        Fails,
    }

    struct CatalogStub {
        live: Live,
        calls: AtomicUsize,
        variables: VariableSet,
    }

    impl CatalogStub {
        fn new(live: Live) -> Arc<Self> {
            Arc::new(Self {
                live,
                calls: AtomicUsize::new(0),
                variables: VariableSet::new(),
            })
        }
    }

    #[async_trait]
    impl Provider for CatalogStub {
        fn name(&self) -> &str {
            "stub"
        }

        fn available_variables(&self) -> &VariableSet {
            &self.variables
        }

        async fn metadata(&self) -> Result<Option<Vec<StationMetadata>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.live {
                Live::Stations => Ok(Some(vec![StationMetadata::new("live-1")])),
                Live::Unsupported => Ok(None),
                Live::Fails => Err(ProviderError::parse("catalog", "boom")),
            }
        }

        async fn download(
            &self,
            _: &str,
            _: &Variable,
            _: DateWindow,
        ) -> Result<RawData, ProviderError> {
            Ok(RawData::Pages(Vec::new()))
        }

        fn parse_chunk(
            &self,
            _: &str,
            _: &RawPage,
            _: &Variable,
        ) -> Result<Vec<Observation>, ProviderError> {
            Ok(Vec::new())
        }
    }

    async fn snapshot_with(dir: &Path, ids: &[&str]) -> PathBuf {
        let path = dir.join("stub.json");
        let stations: Vec<_> = ids.iter().map(|id| StationMetadata::new(*id)).collect();
        write_snapshot(&path, &stations).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_live_catalog_cached_once() {
        let stub = CatalogStub::new(Live::Stations);
        let resolver = MetadataResolver::new(stub.clone(), None);
        assert_eq!(resolver.metadata().await.unwrap().origin(), "live");
        assert!(resolver.metadata().await.unwrap().find("live-1").is_some());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_without_snapshot() {
        let resolver = MetadataResolver::new(CatalogStub::new(Live::Unsupported), None);
        let catalog = resolver.metadata().await.unwrap();
        assert_eq!(*catalog, Catalog::Unsupported);
        assert!(catalog.stations().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_reads_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_with(dir.path(), &["a", "b"]).await;
        let resolver = MetadataResolver::new(CatalogStub::new(Live::Unsupported), Some(path));
        let catalog = resolver.metadata().await.unwrap();
        assert_eq!(catalog.origin(), "snapshot");
        assert_eq!(catalog.stations().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = snapshot_with(dir.path(), &["a"]).await;
        let resolver = MetadataResolver::new(CatalogStub::new(Live::Fails), Some(path));
        assert!(matches!(resolver.metadata().await.unwrap(), Catalog::Snapshot(_)));
    }

    #[tokio::test]
    async fn test_failure_without_snapshot_is_error_and_not_cached() {
        let stub = CatalogStub::new(Live::Fails);
        let dir = tempfile::tempdir().unwrap();
        let resolver = MetadataResolver::new(stub.clone(), Some(dir.path().join("missing.json")));
        assert!(matches!(resolver.metadata().await, Err(MetadataError::Live(_))));
        assert!(resolver.metadata().await.is_err());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_malformed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let resolver = MetadataResolver::new(CatalogStub::new(Live::Unsupported), Some(path));
        assert!(matches!(
            resolver.metadata().await,
            Err(MetadataError::SnapshotFormat { .. })
        ));
    }
}
