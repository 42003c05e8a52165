//! # docsfs
//!
//! A virtual file system over a remote document store.
//!
//! ## Features
//!
//! - **Directory tree**: an in-memory mirror of the remote hierarchy, loaded
//!   lazily from paginated feeds and bootstrapped offline from a saved
//!   snapshot.
//! - **Filesystem Operations**:
//!   - Resolve paths and list directories.
//!   - Create directories (`create_directory`), optionally recursive.
//!   - Move, rename and delete (`remove`) files/folders.
//!   - Copy hosted documents.
//!   - Get file properties and account quota.
//! - **File Transfers**:
//!   - Downloads land in a local blob cache; concurrent requests for the
//!     same content share one download.
//!   - Chunked uploads with automatic resume support.
//!   - Progress tracking and cancellation of every running transfer.
//! - **Blob cache**: content-addressed by resource id and content hash,
//!   with pinning, dirty tracking, LRU eviction under a quota and
//!   self-healing on startup.
//!
//! Remote calls go through a [`DocumentService`] implementation. The crate
//! ships [`MemoryDocumentService`], an in-process store used by the demo and
//! the tests.
//!
//! ## Example: Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use docsfs::{FileSystem, FsConfig, MemoryDocumentService};
//!
//! # async fn example() -> docsfs::Result<()> {
//! let service = Arc::new(MemoryDocumentService::new());
//! let fs = FileSystem::new(service, FsConfig::with_cache_root("/tmp/docsfs"));
//! fs.initialize().await?;
//!
//! // List files in the root
//! for node in fs.read_directory("/").await? {
//!     println!("{} ({} bytes)", node.title, node.file_info.size);
//! }
//!
//! // Upload a file with resume support
//! fs.resume_upload("local_file.txt".as_ref(), "/remote_file.txt").await?;
//!
//! // Fetch it back through the cache
//! let local = fs.get_file("/remote_file.txt").await?;
//! println!("cached at {}", local.path.display());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod factory;
pub mod filesystem;
pub mod fs;
pub mod observer;
pub mod progress;
pub mod registry;

// Re-export commonly used types
pub use api::{DocumentService, MemoryDocumentService, ServiceError, ServiceErrorCode};
pub use cache::{BlobCache, CacheState};
pub use config::FsConfig;
pub use error::{FsError, Result};
pub use factory::{AccountContext, FileSystemRegistry};
pub use filesystem::{FileSystem, FirstMissingParent, LocalFile};
pub use fs::{FileProperties, Node, Quota};
pub use observer::FileSystemObserver;
pub use progress::{ProgressCallback, ProgressStatus, TransferOutcome, TransferProgress};
pub use registry::OperationObserver;
