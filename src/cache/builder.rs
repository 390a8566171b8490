//! Bulk cache builds for archive-only providers.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::error::CacheError;
use super::store::{BulkStore, CacheRow};
use crate::series::{Observation, StationMetadata};
use crate::transport::{HttpClient, HttpRequest};
use crate::variable::Variable;

/// Largest archive entry read into memory; bigger entries are skipped.
pub const MAX_ENTRY_BYTES: u64 = 512 * 1024 * 1024;

/// Turns one archive entry into canonical rows.
///
/// Entries the decoder does not recognize yield an empty vector.
pub trait ArchiveDecoder: Send + Sync {
    /// Decodes the entry called `name` (its path inside the archive).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Decode`] when a recognized entry is unreadable;
    /// the build logs it and moves on to the next entry.
    fn decode_entry(&self, name: &str, bytes: &[u8]) -> Result<Vec<CacheRow>, CacheError>;

    /// Reads station records from a catalog entry shipped in the archive.
    ///
    /// Called for every entry alongside [`ArchiveDecoder::decode_entry`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Decode`] when a recognized catalog is unreadable.
    fn decode_stations(
        &self,
        _name: &str,
        _bytes: &[u8],
    ) -> Result<Vec<StationMetadata>, CacheError> {
        Ok(Vec::new())
    }
}

/// Everything decoded from one archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveContents {
    /// Observation rows.
    pub rows: Vec<CacheRow>,
    /// Station records from catalog entries.
    pub stations: Vec<StationMetadata>,
}

/// Result of [`BulkCache::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A marker already existed; nothing was downloaded.
    AlreadyBuilt,
    /// The archive was downloaded and this many rows were written.
    Built {
        /// Rows written.
        rows: u64,
    },
}

/// Downloads a provider's archive once and serves slices of it.
///
/// `build`, `query`, `lookup` and `stations` share an async mutex, so a read arriving
/// during a build waits for it instead of starting a second download.
pub struct BulkCache {
    provider: String,
    archive: HttpRequest,
    client: HttpClient,
    store: BulkStore,
    decoder: Arc<dyn ArchiveDecoder>,
    staging_dir: Option<PathBuf>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for BulkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkCache")
            .field("provider", &self.provider)
            .field("archive", &self.archive.url())
            .field("staging_dir", &self.staging_dir)
            .finish_non_exhaustive()
    }
}

impl BulkCache {
    /// Creates a cache for `provider` backed by `store`.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        archive: HttpRequest,
        client: HttpClient,
        store: BulkStore,
        decoder: Arc<dyn ArchiveDecoder>,
    ) -> Self {
        Self {
            provider: provider.into(),
            archive,
            client,
            store,
            decoder,
            staging_dir: None,
            lock: Mutex::new(()),
        }
    }

    /// Stages archive downloads under `dir` instead of the system temp dir.
    #[must_use]
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &BulkStore {
        &self.store
    }

    /// Builds the cache unless a build marker already exists.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the download, extraction or store write
    /// fails. A failed build leaves no marker, so the next call retries.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn build(&self) -> Result<BuildOutcome, CacheError> {
        let _guard = self.lock.lock().await;
        if self.store.is_built(&self.provider).await? {
            debug!("bulk cache already built");
            return Ok(BuildOutcome::AlreadyBuilt);
        }
        self.build_locked().await
    }

    /// Builds again from a fresh download, replacing the current contents
    /// only once the new archive has been read.
    ///
    /// # Errors
    ///
    /// Same as [`BulkCache::build`]. On failure the previous build, marker
    /// included, is left in place.
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn rebuild(&self) -> Result<BuildOutcome, CacheError> {
        let _guard = self.lock.lock().await;
        self.build_locked().await
    }

    /// Observations for one gauge and variable within `[start, end]`,
    /// building the cache first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when a required build fails or the store
    /// query fails.
    pub async fn query(
        &self,
        gauge_id: &str,
        variable: &Variable,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Observation>, CacheError> {
        let _guard = self.lock.lock().await;
        self.ensure_built().await?;
        self.store
            .query(&self.provider, gauge_id, variable, start, end)
            .await
    }

    /// Like [`BulkCache::query`], but tells an unknown series apart from an
    /// empty window.
    ///
    /// Returns `None` when the archive holds no series at all for this gauge
    /// and variable, and `Some` (possibly empty) when it does.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when a required build fails or the store
    /// query fails.
    pub async fn lookup(
        &self,
        gauge_id: &str,
        variable: &Variable,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<Vec<Observation>>, CacheError> {
        let _guard = self.lock.lock().await;
        self.ensure_built().await?;
        if !self
            .store
            .has_series(&self.provider, gauge_id, variable)
            .await?
        {
            return Ok(None);
        }
        self.store
            .query(&self.provider, gauge_id, variable, start, end)
            .await
            .map(Some)
    }

    /// Station records shipped in the archive, building the cache first if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when a required build fails or the store
    /// query fails.
    pub async fn stations(&self) -> Result<Vec<StationMetadata>, CacheError> {
        let _guard = self.lock.lock().await;
        self.ensure_built().await?;
        self.store.stations(&self.provider).await
    }

    async fn ensure_built(&self) -> Result<(), CacheError> {
        if !self.store.is_built(&self.provider).await? {
            info!(provider = %self.provider, "bulk cache missing, building before read");
            self.build_locked().await?;
        }
        Ok(())
    }

    async fn build_locked(&self) -> Result<BuildOutcome, CacheError> {
        let staging = match &self.staging_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| CacheError::io(dir, e))?;
                tempfile::Builder::new()
                    .prefix("hydrofetch-")
                    .tempdir_in(dir)
                    .map_err(|e| CacheError::io(dir, e))?
            }
            None => tempfile::Builder::new()
                .prefix("hydrofetch-")
                .tempdir()
                .map_err(|e| CacheError::io(std::env::temp_dir(), e))?,
        };
        let archive_path = staging.path().join("archive.zip");

        info!(url = %self.archive.url(), "downloading bulk archive");
        let bytes = self
            .client
            .download_to_path(&self.archive, &archive_path)
            .await?;
        debug!(bytes, "archive downloaded");

        let decoder = Arc::clone(&self.decoder);
        let path = archive_path.clone();
        let contents =
            tokio::task::spawn_blocking(move || extract_archive(&path, decoder.as_ref()))
                .await
                .map_err(|e| {
                    CacheError::archive(&archive_path, format!("extraction task failed: {e}"))
                })??;

        let written = self
            .store
            .replace(
                &self.provider,
                &contents.rows,
                &contents.stations,
                self.archive.url(),
            )
            .await?;
        info!(rows = written, stations = contents.stations.len(), "bulk cache built");
        Ok(BuildOutcome::Built { rows: written })
    }
}

/// Reads every file entry of the ZIP at `path` through `decoder`.
///
/// Entries that fail to decode, or that inflate past [`MAX_ENTRY_BYTES`],
/// are logged and skipped.
///
/// # Errors
///
/// Returns [`CacheError::Archive`] if the file is not a readable ZIP.
pub fn extract_archive(
    path: &Path,
    decoder: &dyn ArchiveDecoder,
) -> Result<ArchiveContents, CacheError> {
    extract_capped(path, decoder, MAX_ENTRY_BYTES)
}

fn extract_capped(
    path: &Path,
    decoder: &dyn ArchiveDecoder,
    max_entry_bytes: u64,
) -> Result<ArchiveContents, CacheError> {
    let file = std::fs::File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| CacheError::archive(path, e.to_string()))?;

    let mut contents = ArchiveContents::default();
    let mut skipped = 0_usize;
    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(index, error = %error, "unreadable archive entry");
                skipped += 1;
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        // The declared size can lie, so the read itself is bounded.
        let mut bytes = Vec::new();
        if let Err(error) = (&mut entry)
            .take(max_entry_bytes.saturating_add(1))
            .read_to_end(&mut bytes)
        {
            warn!(entry = %name, error = %error, "failed to read archive entry");
            skipped += 1;
            continue;
        }
        if bytes.len() as u64 > max_entry_bytes {
            warn!(entry = %name, limit = max_entry_bytes, "archive entry too large, skipping");
            skipped += 1;
            continue;
        }
        match decoder.decode_entry(&name, &bytes) {
            Ok(decoded) => contents.rows.extend(decoded),
            Err(error) => {
                warn!(entry = %name, error = %error, "skipping undecodable entry");
                skipped += 1;
            }
        }
        match decoder.decode_stations(&name, &bytes) {
            Ok(stations) => contents.stations.extend(stations),
            Err(error) => {
                warn!(entry = %name, error = %error, "skipping unreadable station catalog");
                skipped += 1;
            }
        }
    }

    debug!(
        rows = contents.rows.len(),
        stations = contents.stations.len(),
        skipped,
        "archive extracted"
    );
    Ok(contents)
}
