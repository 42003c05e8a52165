//! The remote document service capability.
//!
//! The HTTP client itself lives outside this crate. Anything that can list,
//! transfer and mutate remote entries can back a [`FileSystem`](crate::FileSystem)
//! by implementing [`DocumentService`].

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ServiceResult;
use crate::progress::ProgressCallback;

/// Account storage figures reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMetadata {
    pub bytes_total: u64,
    pub bytes_used: u64,
}

/// Parameters for opening a resumable upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub title: String,
    pub content_type: String,
    pub content_length: u64,
    /// Upload locator of the destination directory
    pub parent_locator: String,
}

/// Result of sending one chunk of an upload session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// The service acknowledged bytes up to `next_offset` and expects more.
    Incomplete { next_offset: u64 },
    /// The upload finished; carries the feed entry of the stored file.
    Complete(Value),
}

/// Remote operations consumed by the file system.
///
/// Entry-returning calls answer with a single feed entry in the same JSON
/// shape a feed page lists under `entries`.
#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Feed locator of the root collection.
    fn root_content_url(&self) -> String;

    /// Upload locator of the root collection.
    fn root_upload_url(&self) -> String;

    /// Obtain an access token.
    async fn authenticate(&self) -> ServiceResult<String>;

    /// Fetch one feed page. `None` requests the first page of the root feed.
    async fn fetch_feed(&self, url: Option<&str>) -> ServiceResult<Value>;

    async fn account_metadata(&self) -> ServiceResult<AccountMetadata>;

    /// Download `content_url` into `destination`, returning the byte count.
    ///
    /// Stops with [`ServiceErrorCode::Cancelled`](super::ServiceErrorCode::Cancelled)
    /// when `progress` returns `false`.
    async fn download(
        &self,
        content_url: &str,
        destination: &Path,
        progress: ProgressCallback,
    ) -> ServiceResult<u64>;

    /// Open an upload session and return its locator.
    async fn initiate_upload(&self, request: UploadRequest) -> ServiceResult<String>;

    async fn send_chunk(
        &self,
        session: &str,
        offset: u64,
        bytes: Vec<u8>,
        total: u64,
    ) -> ServiceResult<ChunkOutcome>;

    /// Query how many bytes of a session the service already holds.
    async fn query_upload(&self, session: &str) -> ServiceResult<u64>;

    async fn create_directory(&self, parent_content_url: &str, title: &str)
    -> ServiceResult<Value>;

    /// Copy a hosted document. The copy lands in the root collection.
    async fn copy_document(&self, resource_id: &str, title: &str) -> ServiceResult<Value>;

    async fn delete_entry(&self, edit_url: &str) -> ServiceResult<()>;

    async fn rename_entry(&self, edit_url: &str, title: &str) -> ServiceResult<()>;

    async fn add_to_parent(&self, parent_content_url: &str, edit_url: &str) -> ServiceResult<()>;

    async fn remove_from_parent(
        &self,
        parent_content_url: &str,
        resource_id: &str,
    ) -> ServiceResult<()>;
}
