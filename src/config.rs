//! File system configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for a [`FileSystem`](crate::FileSystem) instance.
///
/// Every field has a default, so a JSON file only needs to name the values
/// it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Root of the on-disk cache layout
    pub cache_root: PathBuf,
    /// Quota for all cached blobs (None = unlimited)
    pub max_cache_bytes: Option<u64>,
    /// Free disk space to keep available when storing blobs (0 = off)
    pub min_free_disk_bytes: u64,
    /// Bytes sent per upload chunk
    pub upload_chunk_size: usize,
    /// Transient retries per upload chunk
    pub chunk_retry_attempts: u32,
    /// Retries for idempotent reads (feeds, account metadata)
    pub read_retry_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds
    pub retry_base_delay_ms: u64,
    /// Minimum interval between progress notifications, in milliseconds
    pub progress_throttle_ms: u64,
    /// Command queue depth of the remote-service context
    pub service_queue_depth: usize,
    /// Upper bound on feed continuation pages followed in one refresh
    pub max_feed_pages: usize,
    /// Age after which a saved upload session is no longer resumed
    pub upload_session_ttl_secs: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("GCache").join("v1"),
            max_cache_bytes: None,
            min_free_disk_bytes: 0,
            upload_chunk_size: 512 * 1024,
            chunk_retry_attempts: 3,
            read_retry_attempts: 4,
            retry_base_delay_ms: 250,
            progress_throttle_ms: 200,
            service_queue_depth: 64,
            max_feed_pages: 1000,
            upload_session_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl FsConfig {
    /// Default configuration rooted at `cache_root`.
    pub fn with_cache_root<P: Into<PathBuf>>(cache_root: P) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub(crate) fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub(crate) fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }
}
