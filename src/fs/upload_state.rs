//! Upload state for resume support.
//!
//! This module provides structures for saving and resuming interrupted uploads.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Saved upload state for resuming interrupted uploads.
///
/// Written under the cache's `meta/uploads/` directory after every chunk the
/// service acknowledges, and removed once the upload completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    /// Upload session locator returned by the service
    pub session_url: String,
    /// Bytes already acknowledged
    pub offset: u64,
    /// Total file size
    pub file_size: u64,
    /// Local file being uploaded
    pub source_path: String,
    /// Virtual destination path
    pub destination: String,
    /// Remote file title
    pub title: String,
    pub content_type: String,
    /// Upload locator of the destination directory
    pub parent_locator: String,
    /// SHA-256 hash of first 1MB to verify same file
    pub file_hash: String,
    /// Unix timestamp when upload started
    pub created_at: i64,
}

impl UploadState {
    /// Create a new upload state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_url: String,
        file_size: u64,
        source_path: String,
        destination: String,
        title: String,
        content_type: String,
        parent_locator: String,
        file_hash: String,
    ) -> Self {
        Self {
            session_url,
            offset: 0,
            file_size,
            source_path,
            destination,
            title,
            content_type,
            parent_locator,
            file_hash,
            created_at: now(),
        }
    }

    /// File name for the state of uploading `source` to `destination`.
    pub fn state_file_name(source: &Path, destination: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.as_bytes());
        format!("{}.json", hex::encode(hasher.finalize()))
    }

    /// Save state to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let path = path.as_ref();
        let partial = path.with_extension("partial");
        std::fs::write(&partial, json)?;
        std::fs::rename(&partial, path)?;
        Ok(())
    }

    /// Load state from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&json)?;
        Ok(Some(state))
    }

    /// Delete state file.
    pub fn delete<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Check if the session is younger than `ttl_secs`.
    pub fn is_likely_valid(&self, ttl_secs: u64) -> bool {
        let age = now().saturating_sub(self.created_at);
        age >= 0 && (age as u64) < ttl_secs
    }

    /// Record an acknowledged offset.
    pub fn advance(&mut self, offset: u64) {
        self.offset = offset.min(self.file_size);
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Calculate a simple hash of the first 1MB of a file for verification.
pub fn calculate_file_hash<P: AsRef<Path>>(path: P) -> Result<String> {
    use std::io::Read;

    let file = std::fs::File::open(path.as_ref())?;
    let mut buffer = Vec::with_capacity(1024 * 1024);
    file.take(1024 * 1024).read_to_end(&mut buffer)?;

    let mut hasher = Sha256::new();
    hasher.update(&buffer);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> UploadState {
        UploadState::new(
            "memory://session/1".to_string(),
            1000,
            "/home/user/file.bin".to_string(),
            "/A/file.bin".to_string(),
            "file.bin".to_string(),
            "application/octet-stream".to_string(),
            "memory://upload/f1".to_string(),
            "abc123".to_string(),
        )
    }

    #[test]
    fn test_state_file_name_depends_on_both_paths() {
        let a = UploadState::state_file_name(Path::new("/x/a.bin"), "/A/a.bin");
        let b = UploadState::state_file_name(Path::new("/x/a.bin"), "/B/a.bin");
        assert_ne!(a, b);
        assert!(a.ends_with(".json"));
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        assert!(UploadState::load(&path).unwrap().is_none());

        let mut saved = state();
        saved.advance(512);
        saved.save(&path).unwrap();

        let loaded = UploadState::load(&path).unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.offset, 512);

        UploadState::delete(&path).unwrap();
        UploadState::delete(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_validity_window() {
        let mut s = state();
        assert!(s.is_likely_valid(86_400));
        s.created_at -= 2 * 86_400;
        assert!(!s.is_likely_valid(86_400));
    }

    #[test]
    fn test_advance_clamps_to_size() {
        let mut s = state();
        s.advance(5000);
        assert_eq!(s.offset, 1000);
    }

    #[test]
    fn test_file_hash_reads_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let mut bytes = vec![7u8; 1024 * 1024];
        std::fs::write(&a, &bytes).unwrap();
        bytes.extend_from_slice(b"tail");
        std::fs::write(&b, &bytes).unwrap();

        assert_eq!(calculate_file_hash(&a).unwrap(), calculate_file_hash(&b).unwrap());
    }
}
