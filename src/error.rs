//! Error types for the docsfs library.

use std::io;

use thiserror::Error;

use crate::api::{ServiceError, ServiceErrorCode};

/// Main error type for docsfs operations.
///
/// Every public operation terminates with either a success value or exactly
/// one of these kinds. The type is `Clone` so a single coalesced result
/// (shared refresh, shared download) can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Path or cache entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Parent directory of the target does not exist.
    #[error("Parent directory not found: {0}")]
    ParentNotFound(String),

    /// Directory still has children and the operation was not recursive.
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Expected a file, found something else.
    #[error("Not a file: {0}")]
    NotAFile(String),

    /// Expected a directory, found something else.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Operation is not supported for this kind of entry.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Remote listing could not be parsed.
    #[error("Feed parse error: {0}")]
    ParseError(String),

    /// Permission denied locally or remotely.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The local filesystem reported that it is full.
    #[error("No space left on device: {0}")]
    NoSpace(String),

    /// Eviction could not reclaim enough space without touching protected blobs.
    #[error("Insufficient cache space: need {needed} bytes, {available} reclaimable")]
    InsufficientSpace { needed: u64, available: u64 },

    /// The service no longer knows an upload session.
    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    /// Any other local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Remote document service failure.
    #[error("Network error: {0}")]
    Network(ServiceError),

    /// Operation was cancelled.
    #[error("Operation aborted")]
    Aborted,

    /// Remote response was well-formed JSON but semantically invalid.
    #[error("Invalid response: {0}")]
    ValidationError(String),

    /// A background execution context has shut down.
    #[error("File system stopped")]
    Stopped,
}

impl FsError {
    /// Check whether a retry could succeed without any other change.
    pub fn is_transient(&self) -> bool {
        match self {
            FsError::Network(err) => err.code.is_transient(),
            _ => false,
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => FsError::AccessDenied(err.to_string()),
            io::ErrorKind::StorageFull => FsError::NoSpace(err.to_string()),
            _ => FsError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(err: serde_json::Error) -> Self {
        FsError::ParseError(err.to_string())
    }
}

impl From<ServiceError> for FsError {
    fn from(err: ServiceError) -> Self {
        match err.code {
            ServiceErrorCode::NotFound => FsError::NotFound(err.message),
            ServiceErrorCode::Conflict => FsError::AlreadyExists(err.message),
            ServiceErrorCode::Gone => FsError::SessionExpired(err.message),
            ServiceErrorCode::Unauthorized | ServiceErrorCode::Forbidden => {
                FsError::AccessDenied(err.message)
            }
            ServiceErrorCode::InvalidResponse => FsError::ValidationError(err.message),
            ServiceErrorCode::Cancelled => FsError::Aborted,
            _ => FsError::Network(err),
        }
    }
}

/// Result type alias for docsfs operations.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let not_found: FsError = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(not_found, FsError::NotFound(_)));

        let denied: FsError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(denied, FsError::AccessDenied(_)));

        let full: FsError = io::Error::from(io::ErrorKind::StorageFull).into();
        assert!(matches!(full, FsError::NoSpace(_)));

        let other: FsError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(other, FsError::Io(_)));
    }

    #[test]
    fn test_service_error_mapping() {
        let err: FsError = ServiceError::new(ServiceErrorCode::NotFound, "gone").into();
        assert_eq!(err, FsError::NotFound("gone".to_string()));

        let err: FsError = ServiceError::new(ServiceErrorCode::Gone, "session").into();
        assert_eq!(err, FsError::SessionExpired("session".to_string()));

        let err: FsError = ServiceError::new(ServiceErrorCode::Forbidden, "no").into();
        assert!(matches!(err, FsError::AccessDenied(_)));

        let err: FsError = ServiceError::new(ServiceErrorCode::Unavailable, "busy").into();
        assert!(matches!(err, FsError::Network(_)));
        assert!(err.is_transient());

        let err: FsError = ServiceError::new(ServiceErrorCode::Cancelled, "stop").into();
        assert_eq!(err, FsError::Aborted);
    }
}
