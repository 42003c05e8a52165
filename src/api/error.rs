//! Remote document service status codes.

use std::fmt;

/// Status codes reported by the remote document service.
///
/// Numeric values follow the HTTP status the service answers with; the
/// negative values are transport-level conditions with no HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceErrorCode {
    /// Request was malformed
    BadRequest = 400,
    /// Missing or expired credentials
    Unauthorized = 401,
    /// Caller may not touch this entry
    Forbidden = 403,
    /// Entry or session does not exist
    NotFound = 404,
    /// Entry already exists or was modified concurrently
    Conflict = 409,
    /// Upload session expired or was discarded by the service
    Gone = 410,
    /// Entry changed since the caller last saw it
    PreconditionFailed = 412,
    /// Rate limited
    TooManyRequests = 429,
    /// Server-side failure
    Internal = 500,
    /// Bad gateway
    BadGateway = 502,
    /// Service temporarily unavailable
    Unavailable = 503,
    /// Connection could not be established
    NoConnection = -1,
    /// Response body could not be interpreted
    InvalidResponse = -2,
    /// Request was cancelled before it completed
    Cancelled = -3,
    /// Unknown status
    Unknown = -9999,
}

impl From<i64> for ServiceErrorCode {
    fn from(code: i64) -> Self {
        match code {
            400 => ServiceErrorCode::BadRequest,
            401 => ServiceErrorCode::Unauthorized,
            403 => ServiceErrorCode::Forbidden,
            404 => ServiceErrorCode::NotFound,
            409 => ServiceErrorCode::Conflict,
            410 => ServiceErrorCode::Gone,
            412 => ServiceErrorCode::PreconditionFailed,
            429 => ServiceErrorCode::TooManyRequests,
            500 => ServiceErrorCode::Internal,
            502 => ServiceErrorCode::BadGateway,
            503 => ServiceErrorCode::Unavailable,
            -1 => ServiceErrorCode::NoConnection,
            -2 => ServiceErrorCode::InvalidResponse,
            -3 => ServiceErrorCode::Cancelled,
            _ => ServiceErrorCode::Unknown,
        }
    }
}

impl ServiceErrorCode {
    /// Get human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ServiceErrorCode::BadRequest => "Bad request",
            ServiceErrorCode::Unauthorized => "Authentication required",
            ServiceErrorCode::Forbidden => "Access denied",
            ServiceErrorCode::NotFound => "Resource does not exist",
            ServiceErrorCode::Conflict => "Resource already exists",
            ServiceErrorCode::Gone => "Upload session expired",
            ServiceErrorCode::PreconditionFailed => "Resource was modified",
            ServiceErrorCode::TooManyRequests => "Rate limit exceeded",
            ServiceErrorCode::Internal => "Internal server error",
            ServiceErrorCode::BadGateway => "Bad gateway",
            ServiceErrorCode::Unavailable => "Service unavailable",
            ServiceErrorCode::NoConnection => "No connection",
            ServiceErrorCode::InvalidResponse => "Invalid response",
            ServiceErrorCode::Cancelled => "Request cancelled",
            ServiceErrorCode::Unknown => "Unknown error",
        }
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceErrorCode::TooManyRequests
                | ServiceErrorCode::Internal
                | ServiceErrorCode::BadGateway
                | ServiceErrorCode::Unavailable
                | ServiceErrorCode::NoConnection
        )
    }
}

/// Failure reported by the remote document service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub code: ServiceErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ServiceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an error from a raw status code, using the default description.
    pub fn from_status(status: i64) -> Self {
        let code = ServiceErrorCode::from(status);
        Self::new(code, code.description())
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.description())
    }
}

impl std::error::Error for ServiceError {}

/// Result type alias for raw service calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ServiceErrorCode::from(400), ServiceErrorCode::BadRequest);
        assert_eq!(ServiceErrorCode::from(401), ServiceErrorCode::Unauthorized);
        assert_eq!(ServiceErrorCode::from(403), ServiceErrorCode::Forbidden);
        assert_eq!(ServiceErrorCode::from(404), ServiceErrorCode::NotFound);
        assert_eq!(ServiceErrorCode::from(409), ServiceErrorCode::Conflict);
        assert_eq!(ServiceErrorCode::from(410), ServiceErrorCode::Gone);
        assert_eq!(
            ServiceErrorCode::from(412),
            ServiceErrorCode::PreconditionFailed
        );
        assert_eq!(
            ServiceErrorCode::from(429),
            ServiceErrorCode::TooManyRequests
        );
        assert_eq!(ServiceErrorCode::from(503), ServiceErrorCode::Unavailable);
        assert_eq!(ServiceErrorCode::from(-1), ServiceErrorCode::NoConnection);
        assert_eq!(ServiceErrorCode::from(-3), ServiceErrorCode::Cancelled);

        assert_eq!(ServiceErrorCode::from(418), ServiceErrorCode::Unknown);
    }

    #[test]
    fn test_transient_codes() {
        assert!(ServiceErrorCode::Unavailable.is_transient());
        assert!(ServiceErrorCode::TooManyRequests.is_transient());
        assert!(ServiceErrorCode::NoConnection.is_transient());
        assert!(!ServiceErrorCode::NotFound.is_transient());
        assert!(!ServiceErrorCode::Conflict.is_transient());
        assert!(!ServiceErrorCode::Forbidden.is_transient());
    }

    #[test]
    fn test_from_status_uses_description() {
        let err = ServiceError::from_status(404);
        assert_eq!(err.code, ServiceErrorCode::NotFound);
        assert_eq!(err.message, "Resource does not exist");
    }
}
