//! Progress reporting for file transfers.

/// Progress information for uploads and downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub done: u64,
    /// Total bytes to transfer
    pub total: u64,
    /// Name of the file being transferred
    pub filename: String,
}

impl TransferProgress {
    /// Create a new progress report.
    pub fn new(done: u64, total: u64, filename: impl Into<String>) -> Self {
        Self {
            done,
            total,
            filename: filename.into(),
        }
    }
}

/// Type alias for progress callback function.
///
/// The callback receives progress information and can return `false` to cancel the transfer.
pub type ProgressCallback = Box<dyn FnMut(&TransferProgress) -> bool + Send>;

/// A callback that never cancels and ignores progress.
pub fn noop_progress() -> ProgressCallback {
    Box::new(|_| true)
}

/// Kind of long-running operation tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Upload,
    Download,
}

/// Point-in-time view of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressStatus {
    pub operation_id: u64,
    pub virtual_path: String,
    pub kind: TransferKind,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
}

impl ProgressStatus {
    /// Progress as a percentage (0.0 to 100.0).
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64) * 100.0
    }
}

/// How an operation ended. Delivered to observers exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(done: u64, total: u64) -> ProgressStatus {
        ProgressStatus {
            operation_id: 1,
            virtual_path: "/a.txt".to_string(),
            kind: TransferKind::Download,
            bytes_transferred: done,
            bytes_total: total,
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(status(25, 100).percent(), 25.0);
        assert_eq!(status(0, 0).percent(), 0.0);
    }
}
