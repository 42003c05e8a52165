//! Remote document service boundary.

pub mod actor;
pub mod error;
pub mod memory;
pub mod service;

pub use actor::ServiceHandle;
pub use error::{ServiceError, ServiceErrorCode, ServiceResult};
pub use memory::{MemoryDocumentService, ServiceCall};
pub use service::{AccountMetadata, ChunkOutcome, DocumentService, UploadRequest};
