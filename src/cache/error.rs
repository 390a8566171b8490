//! Error types for the bulk cache.

use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised while building or reading a bulk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Database query or connection failure.
    #[error("bulk cache database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("failed to run bulk cache migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The archive could not be downloaded.
    #[error("failed to download archive: {0}")]
    Download(#[from] TransportError),

    /// The archive could not be opened or read.
    #[error("failed to read archive {path}: {reason}")]
    Archive {
        /// Archive location.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// An archive entry could not be decoded.
    #[error("failed to decode archive entry {entry}: {reason}")]
    Decode {
        /// Entry name inside the archive.
        entry: String,
        /// What went wrong.
        reason: String,
    },

    /// Staging directory or file system failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// Creates an archive error.
    pub fn archive(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
