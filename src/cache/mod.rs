//! Bulk cache for archive-only providers.
//!
//! Some agencies publish data only as one large archive. For them the
//! [`BulkCache`] downloads the archive once, decodes every entry through the
//! provider's [`ArchiveDecoder`], and stores canonical rows in a SQLite
//! [`BulkStore`]. Later requests are answered from the store.
//!
//! The cache is never patched incrementally: data published after the build
//! is only picked up by an explicit [`BulkCache::rebuild`].

mod builder;
mod error;
mod store;

pub use builder::{
    ArchiveContents, ArchiveDecoder, BuildOutcome, BulkCache, MAX_ENTRY_BYTES, extract_archive,
};
pub use error::CacheError;
pub use store::{BuildMarker, BulkStore, CacheRow};
