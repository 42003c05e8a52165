//! Metadata kept next to the blobs: feed snapshots, upload sessions and
//! hosted-document placeholders.

use std::path::{Path, PathBuf};

use serde_json::json;

use super::layout::{CacheLayout, escape_component};
use super::run_blocking;
use crate::error::Result;
use crate::fs::feed::FeedPage;
use crate::fs::upload_state::UploadState;

#[derive(Debug, Clone)]
pub struct MetadataStore {
    layout: CacheLayout,
}

impl MetadataStore {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    /// Persist the complete root feed for offline bootstrap.
    pub async fn save_root_feed(&self, page: FeedPage) -> Result<()> {
        let path = self.layout.root_feed_path();
        run_blocking(move || {
            let json = serde_json::to_vec(&page)?;
            write_atomic(&path, &json)
        })
        .await
    }

    /// The last persisted root feed, if any.
    pub async fn load_root_feed(&self) -> Result<Option<FeedPage>> {
        let path = self.layout.root_feed_path();
        run_blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            let json = std::fs::read(&path)?;
            Ok(Some(serde_json::from_slice(&json)?))
        })
        .await
    }

    pub fn upload_state_path(&self, source: &Path, destination: &str) -> PathBuf {
        self.layout
            .uploads_dir()
            .join(UploadState::state_file_name(source, destination))
    }

    pub async fn save_upload_state(&self, state: &UploadState) -> Result<()> {
        let path = self.upload_state_path(Path::new(&state.source_path), &state.destination);
        let state = state.clone();
        run_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            state.save(&path)
        })
        .await
    }

    pub async fn load_upload_state(
        &self,
        source: &Path,
        destination: &str,
    ) -> Result<Option<UploadState>> {
        let path = self.upload_state_path(source, destination);
        run_blocking(move || UploadState::load(&path)).await
    }

    pub async fn delete_upload_state(&self, source: &Path, destination: &str) -> Result<()> {
        let path = self.upload_state_path(source, destination);
        run_blocking(move || UploadState::delete(&path)).await
    }

    /// Write the JSON descriptor that stands in for a hosted document.
    pub async fn write_document_placeholder(
        &self,
        resource_id: &str,
        edit_url: &str,
        content_url: &str,
    ) -> Result<PathBuf> {
        let path = self.layout.documents_dir().join(format!("{}.gdoc", escape_component(resource_id)));
        let body = json!({
            "url": edit_url,
            "resource_id": resource_id,
            "content_url": content_url,
        });
        run_blocking(move || {
            write_atomic(&path, &serde_json::to_vec(&body)?)?;
            Ok(path)
        })
        .await
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let partial = path.with_extension("partial");
    std::fs::write(&partial, bytes)?;
    std::fs::rename(&partial, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use serde_json::Value;

    fn store(dir: &Path) -> MetadataStore {
        let layout = CacheLayout::new(dir.join("cache"));
        layout.create_dirs().unwrap();
        MetadataStore::new(layout)
    }

    #[tokio::test]
    async fn test_root_feed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let meta = store(dir.path());
        assert!(meta.load_root_feed().await.unwrap().is_none());

        let page: FeedPage = serde_json::from_value(json!({
            "entries": [{"kind": "folder", "resource_id": "f1", "title": "A",
                         "content_url": "feeds/f1"}]
        }))
        .unwrap();
        meta.save_root_feed(page.clone()).await.unwrap();

        assert_eq!(meta.load_root_feed().await.unwrap(), Some(page));
    }

    #[tokio::test]
    async fn test_snapshot_saved_before_cache_dirs_exist() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetadataStore::new(CacheLayout::new(dir.path().join("fresh")));

        meta.save_root_feed(FeedPage::default()).await.unwrap();

        assert_eq!(meta.load_root_feed().await.unwrap(), Some(FeedPage::default()));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let meta = store(dir.path());
        std::fs::write(meta.layout.root_feed_path(), b"{").unwrap();

        assert!(matches!(
            meta.load_root_feed().await,
            Err(FsError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_placeholder_encodes_locators() {
        let dir = tempfile::tempdir().unwrap();
        let meta = store(dir.path());

        let path = meta
            .write_document_placeholder("document:r1", "edit/r1", "export/r1")
            .await
            .unwrap();

        assert!(path.ends_with("document%3Ar1.gdoc"));
        let body: Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(body["resource_id"], "document:r1");
        assert_eq!(body["url"], "edit/r1");
        assert_eq!(body["content_url"], "export/r1");
    }

    #[tokio::test]
    async fn test_upload_state_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let meta = store(dir.path());
        let source = dir.path().join("a.bin");
        let state = UploadState::new(
            "session".to_string(),
            10,
            source.to_string_lossy().into_owned(),
            "/a.bin".to_string(),
            "a.bin".to_string(),
            "application/octet-stream".to_string(),
            "upload/root".to_string(),
            "hash".to_string(),
        );

        meta.save_upload_state(&state).await.unwrap();
        assert_eq!(
            meta.load_upload_state(&source, "/a.bin").await.unwrap(),
            Some(state)
        );
        meta.delete_upload_state(&source, "/a.bin").await.unwrap();
        assert!(meta.load_upload_state(&source, "/a.bin").await.unwrap().is_none());
    }
}
