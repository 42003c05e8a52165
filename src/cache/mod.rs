//! Local blob cache and metadata storage.

pub mod blob_cache;
pub mod layout;
pub mod meta;

pub use blob_cache::{BlobCache, CacheState, CachedFileOrigin, StoreMode};
pub use layout::{CacheLayout, CacheSubdir};
pub use meta::MetadataStore;

use crate::error::{FsError, Result};

/// Run blocking filesystem work on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::Io(format!("blocking task failed: {}", e)))?
}
