//! Materializing remote files on local disk.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::cache::{CachedFileOrigin, StoreMode};
use crate::error::{FsError, Result};
use crate::filesystem::FileSystem;
use crate::fs::Node;
use crate::fs::utils::normalize_path;
use crate::progress::{ProgressCallback, TransferKind, TransferOutcome};

/// A file available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// `path` is a JSON placeholder pointing at a hosted document rather
    /// than the document's bytes.
    pub is_hosted_document: bool,
}

struct DownloadJob {
    virtual_path: String,
    resource_id: String,
    hash: String,
    content_url: String,
    size: u64,
}

impl FileSystem {
    /// Make the file at `path` available locally.
    ///
    /// Cached content is returned without a network round trip. Concurrent
    /// requests for the same content share one download. Hosted documents
    /// have no byte stream and yield a placeholder descriptor instead.
    pub async fn get_file(&self, path: &str) -> Result<LocalFile> {
        let node = self.resolve(path).await?;
        let file = node
            .as_file()
            .ok_or_else(|| FsError::NotAFile(path.to_string()))?;

        if file.is_hosted_document {
            let placeholder = self
                .inner
                .meta
                .write_document_placeholder(&node.resource_id, &node.edit_url, &file.content_url)
                .await?;
            return Ok(LocalFile {
                path: placeholder,
                is_hosted_document: true,
            });
        }

        match self
            .inner
            .cache
            .retrieve(&node.resource_id, &file.content_hash)
            .await
        {
            Ok(path) => {
                return Ok(LocalFile {
                    path,
                    is_hosted_document: false,
                });
            }
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let path = self.download_once(&normalize_path(path), &node).await?;
        Ok(LocalFile {
            path,
            is_hosted_document: false,
        })
    }

    /// Cached content of the file at `path`, without downloading.
    pub async fn get_from_cache_for_path(&self, path: &str) -> Result<PathBuf> {
        let node = self.resolve(path).await?;
        let file = node
            .as_file()
            .ok_or_else(|| FsError::NotAFile(path.to_string()))?;
        self.inner
            .cache
            .retrieve(&node.resource_id, &file.content_hash)
            .await
    }

    async fn download_once(&self, virtual_path: &str, node: &Node) -> Result<PathBuf> {
        let file = node
            .as_file()
            .ok_or_else(|| FsError::NotAFile(virtual_path.to_string()))?;
        let key = (node.resource_id.clone(), file.content_hash.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();

        {
            let mut inflight = self.inner.downloads.lock();
            if let Some(waiters) = inflight.get_mut(&key) {
                debug!(path = virtual_path, "joining download in flight");
                waiters.push(tx);
            } else {
                // A download may have finished between the cache miss and here.
                if let Some(path) = self.inner.cache.peek(&key.0, &key.1) {
                    return Ok(path);
                }
                inflight.insert(key.clone(), vec![tx]);

                let job = DownloadJob {
                    virtual_path: virtual_path.to_string(),
                    resource_id: key.0,
                    hash: key.1,
                    content_url: file.content_url.clone(),
                    size: node.file_info.size,
                };
                let fs = self.clone();
                tokio::spawn(async move {
                    let result = fs.run_download(&job).await;
                    let waiters = fs
                        .inner
                        .downloads
                        .lock()
                        .remove(&(job.resource_id, job.hash))
                        .unwrap_or_default();
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                });
            }
        }

        rx.await.map_err(|_| FsError::Stopped)?
    }

    async fn run_download(&self, job: &DownloadJob) -> Result<PathBuf> {
        let registry = &self.inner.registry;
        let (id, token) = registry.register(&job.virtual_path, TransferKind::Download, job.size);
        let progress = registry.progress_callback(id, token);

        match self.fetch_into_cache(job, progress).await {
            Ok(path) => {
                // A cancel that raced the last byte still wins.
                if !registry.finish(id, TransferOutcome::Completed) {
                    if let Err(err) = self.inner.cache.discard(&job.resource_id, &job.hash).await {
                        warn!(path = %job.virtual_path, error = %err, "cannot discard cancelled download");
                    }
                    return Err(FsError::Aborted);
                }
                info!(path = %job.virtual_path, bytes = job.size, "downloaded file");
                Ok(path)
            }
            Err(err) => {
                let outcome = match &err {
                    FsError::Aborted => TransferOutcome::Cancelled,
                    other => TransferOutcome::Failed(other.to_string()),
                };
                registry.finish(id, outcome);
                Err(err)
            }
        }
    }

    async fn fetch_into_cache(&self, job: &DownloadJob, progress: ProgressCallback) -> Result<PathBuf> {
        let cache = &self.inner.cache;
        cache.initialize().await?;
        let temp = cache.layout().staging_path();

        let result = async {
            self.inner
                .service
                .download(&job.content_url, temp.clone(), progress)
                .await?;
            cache
                .store(
                    &job.resource_id,
                    &job.hash,
                    &temp,
                    CachedFileOrigin::FromServer,
                    StoreMode::Move,
                )
                .await
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp).await;
        }
        result
    }
}
