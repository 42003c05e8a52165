//! The virtual file system facade.
//!
//! [`FileSystem`] ties the directory tree, the blob cache, the metadata
//! store and the remote-service actor together. Every entry point is an
//! async method; a clone is a cheap handle onto the same instance.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use docsfs::{FileSystem, FsConfig, MemoryDocumentService};
//!
//! # async fn example() -> docsfs::Result<()> {
//! let service = Arc::new(MemoryDocumentService::new());
//! service.add_folder("folder:1", "Reports", None);
//! service.add_file("file:2", "q1.csv", Some("folder:1"), b"a,b\n");
//!
//! let fs = FileSystem::new(service, FsConfig::with_cache_root("/tmp/docsfs"));
//! fs.initialize().await?;
//! let local = fs.get_file("/Reports/q1.csv").await?;
//! println!("cached at {}", local.path.display());
//! fs.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod operations;
mod refresh;
mod resolve;

pub use operations::{FirstMissingParent, LocalFile};
pub use refresh::{RefreshScope, RefreshState};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::info;

use crate::api::{DocumentService, ServiceHandle};
use crate::cache::{BlobCache, CacheState, MetadataStore};
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::fs::{DirectoryTree, FileProperties, NodeId, Quota};
use crate::observer::{FileSystemObserver, ObserverList};
use crate::progress::ProgressStatus;
use crate::registry::{OperationObserver, OperationRegistry};

use refresh::RefreshRequest;

type Waiters<T> = Vec<oneshot::Sender<Result<T>>>;

pub(crate) struct FsInner {
    config: FsConfig,
    service: ServiceHandle,
    tree: Mutex<DirectoryTree>,
    cache: BlobCache,
    meta: MetadataStore,
    registry: Arc<OperationRegistry>,
    observers: Arc<ObserverList<dyn FileSystemObserver>>,
    refreshes: Mutex<HashMap<RefreshRequest, Waiters<()>>>,
    downloads: Mutex<HashMap<(String, String), Waiters<PathBuf>>>,
    stopped: AtomicBool,
}

/// A virtual file system over a remote document store.
#[derive(Clone)]
pub struct FileSystem {
    inner: Arc<FsInner>,
}

impl FileSystem {
    /// Create a file system backed by `service`.
    ///
    /// Spawns the remote-service actor, so this must run inside a tokio
    /// runtime. Nothing is read from disk or the network until first use.
    pub fn new(service: Arc<dyn DocumentService>, config: FsConfig) -> Self {
        let root_content_url = service.root_content_url();
        let root_upload_url = service.root_upload_url();
        let observers: Arc<ObserverList<dyn FileSystemObserver>> =
            Arc::new(ObserverList::default());
        let cache = BlobCache::with_observers(&config, observers.clone());
        let meta = MetadataStore::new(cache.layout().clone());
        let registry = Arc::new(OperationRegistry::new(config.progress_throttle()));
        let handle = ServiceHandle::spawn(service, &config);

        Self {
            inner: Arc::new(FsInner {
                tree: Mutex::new(DirectoryTree::new(&root_content_url, &root_upload_url)),
                service: handle,
                cache,
                meta,
                registry,
                observers,
                refreshes: Mutex::new(HashMap::new()),
                downloads: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &BlobCache {
        &self.inner.cache
    }

    /// Prepare the cache and load the root feed snapshot, if any.
    ///
    /// Works offline. Missing paths are fetched from the service lazily.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_running()?;
        self.inner.cache.initialize().await?;
        self.refresh(RefreshRequest::cached_root()).await?;
        info!(root = %self.inner.cache.layout().root().display(), "file system ready");
        Ok(())
    }

    /// Obtain an access token from the service.
    pub async fn authenticate(&self) -> Result<String> {
        self.ensure_running()?;
        self.inner.service.authenticate().await
    }

    /// Storage quota of the account.
    pub async fn get_available_space(&self) -> Result<Quota> {
        self.ensure_running()?;
        let meta = self.inner.service.account_metadata().await?;
        Ok(Quota {
            total: meta.bytes_total,
            used: meta.bytes_used,
        })
    }

    /// Properties of the file at `path`.
    pub async fn get_file_info_from_path(&self, path: &str) -> Result<FileProperties> {
        let node = self.resolve(path).await?;
        let file = node
            .as_file()
            .ok_or_else(|| FsError::NotAFile(path.to_string()))?;
        Ok(FileProperties {
            file_info: node.file_info.clone(),
            resource_id: node.resource_id.clone(),
            file_md5: file.content_hash.clone(),
            content_url: file.content_url.clone(),
            edit_url: node.edit_url.clone(),
            is_hosted_document: file.is_hosted_document,
        })
    }

    pub async fn get_cache_state(&self, resource_id: &str, hash: &str) -> Result<Option<CacheState>> {
        self.ensure_running()?;
        self.inner.cache.state(resource_id, hash).await
    }

    /// Pin or unpin the cached content of the file at `path`.
    pub async fn set_pinned(&self, path: &str, pinned: bool) -> Result<()> {
        let node = self.resolve(path).await?;
        let file = node
            .as_file()
            .ok_or_else(|| FsError::NotAFile(path.to_string()))?;
        if pinned {
            self.inner.cache.pin(&node.resource_id, &file.content_hash).await
        } else {
            self.inner
                .cache
                .unpin(&node.resource_id, &file.content_hash)
                .await
        }
    }

    /// Scratch directory inside the cache, discarded on restart.
    pub fn cache_tmp_directory(&self) -> PathBuf {
        self.inner.cache.tmp_dir()
    }

    pub fn add_observer(&self, observer: Arc<dyn FileSystemObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn FileSystemObserver>) {
        self.inner.observers.remove(observer);
    }

    pub fn add_operation_observer(&self, observer: Arc<dyn OperationObserver>) {
        self.inner.registry.add_observer(observer);
    }

    pub fn remove_operation_observer(&self, observer: &Arc<dyn OperationObserver>) {
        self.inner.registry.remove_observer(observer);
    }

    /// Snapshots of every running upload and download.
    pub fn get_progress_status_list(&self) -> Vec<ProgressStatus> {
        self.inner.registry.list_in_progress()
    }

    /// Cancel the transfer running on `path`. Returns whether one was found.
    pub fn cancel_operation(&self, path: &str) -> bool {
        self.inner
            .registry
            .cancel(&crate::fs::utils::normalize_path(path))
    }

    /// Stop the instance. Running transfers are cancelled and every later
    /// call fails with [`FsError::Stopped`].
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.registry.cancel_all();
        self.inner.service.shutdown().await;
        info!("file system stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(FsError::Stopped);
        }
        Ok(())
    }

    fn notify_directory_changed(&self, path: &str) {
        self.inner
            .observers
            .notify(|o| o.on_directory_changed(path));
    }
}

/// Node of a directory given by resource id; the root has none.
fn locate(tree: &DirectoryTree, resource_id: &str) -> Option<NodeId> {
    if resource_id.is_empty() {
        Some(tree.root())
    } else {
        tree.find_by_resource_id(resource_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::MemoryDocumentService;
    use crate::observer::tests::RecordingObserver;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub(crate) service: Arc<MemoryDocumentService>,
        pub(crate) fs: FileSystem,
        pub(crate) dir: TempDir,
    }

    pub(crate) fn config_in(dir: &TempDir) -> FsConfig {
        FsConfig {
            retry_base_delay_ms: 1,
            progress_throttle_ms: 0,
            ..FsConfig::with_cache_root(dir.path().join("GCache").join("v1"))
        }
    }

    /// A file system over an account holding
    /// `/A/B/c.txt`, `/A/notes.txt` and the hosted document `/Plan`.
    pub(crate) fn fixture() -> Fixture {
        let service = Arc::new(MemoryDocumentService::new());
        service.add_folder("folder:a", "A", None);
        service.add_folder("folder:b", "B", Some("folder:a"));
        service.add_file("file:c", "c.txt", Some("folder:b"), b"hello world");
        service.add_file("file:n", "notes.txt", Some("folder:a"), b"notes");
        service.add_hosted_document("doc:p", "Plan", None);
        fixture_with(service)
    }

    pub(crate) fn fixture_with(service: Arc<MemoryDocumentService>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileSystem::new(service.clone(), config_in(&dir));
        Fixture { service, fs, dir }
    }

    #[tokio::test]
    async fn test_file_info_and_quota() {
        let f = fixture();
        let props = f.fs.get_file_info_from_path("/A/B/c.txt").await.unwrap();
        assert_eq!(props.resource_id, "file:c");
        assert_eq!(props.file_info.size, 11);
        assert_eq!(
            props.file_md5,
            MemoryDocumentService::content_hash_of(b"hello world")
        );
        assert!(!props.is_hosted_document);

        assert!(matches!(
            f.fs.get_file_info_from_path("/A").await,
            Err(FsError::NotAFile(_))
        ));

        let quota = f.fs.get_available_space().await.unwrap();
        assert!(quota.total > quota.used);
    }

    #[tokio::test]
    async fn test_pin_by_path_notifies_observers() {
        let f = fixture();
        let recorder = Arc::new(RecordingObserver::default());
        f.fs.add_observer(recorder.clone());

        f.fs.get_file("/A/notes.txt").await.unwrap();
        f.fs.set_pinned("/A/notes.txt", true).await.unwrap();

        let hash = MemoryDocumentService::content_hash_of(b"notes");
        let state = f.fs.get_cache_state("file:n", &hash).await.unwrap().unwrap();
        assert!(state.pinned);
        assert!(
            recorder
                .events
                .lock()
                .contains(&format!("pinned file:n {}", hash))
        );

        f.fs.set_pinned("/A/notes.txt", false).await.unwrap();
        let state = f.fs.get_cache_state("file:n", &hash).await.unwrap().unwrap();
        assert!(!state.pinned);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail_stopped() {
        let f = fixture();
        f.fs.initialize().await.unwrap();
        f.fs.shutdown().await;
        f.fs.shutdown().await;

        assert!(f.fs.is_stopped());
        assert_eq!(f.fs.authenticate().await, Err(FsError::Stopped));
        assert_eq!(
            f.fs.find_entry_by_path("/A").await.map(|n| n.title),
            Err(FsError::Stopped)
        );
        assert_eq!(f.fs.get_file("/A/notes.txt").await, Err(FsError::Stopped));
    }
}
