//! Registry of in-flight uploads and downloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::observer::ObserverList;
use crate::progress::{
    ProgressCallback, ProgressStatus, TransferKind, TransferOutcome, TransferProgress,
};

pub type OperationId = u64;

/// Receives progress of registered operations.
pub trait OperationObserver: Send + Sync {
    /// Throttled; not every byte is reported.
    fn on_progress(&self, status: &ProgressStatus);

    /// Called exactly once per operation.
    fn on_finished(&self, status: &ProgressStatus, outcome: &TransferOutcome);
}

struct Operation {
    status: ProgressStatus,
    token: CancellationToken,
    last_notified: Option<Instant>,
}

pub struct OperationRegistry {
    operations: Mutex<HashMap<OperationId, Operation>>,
    next_id: AtomicU64,
    throttle: Duration,
    observers: ObserverList<dyn OperationObserver>,
}

impl OperationRegistry {
    pub fn new(throttle: Duration) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            throttle,
            observers: ObserverList::default(),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn OperationObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn OperationObserver>) {
        self.observers.remove(observer);
    }

    /// Track a new operation. The token is cancelled by [`cancel`](Self::cancel).
    pub fn register(
        &self,
        virtual_path: &str,
        kind: TransferKind,
        bytes_total: u64,
    ) -> (OperationId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.operations.lock().insert(
            id,
            Operation {
                status: ProgressStatus {
                    operation_id: id,
                    virtual_path: virtual_path.to_string(),
                    kind,
                    bytes_transferred: 0,
                    bytes_total,
                },
                token: token.clone(),
                last_notified: None,
            },
        );
        debug!(operation_id = id, path = virtual_path, ?kind, "registered operation");
        (id, token)
    }

    /// Record progress, notifying observers at most once per throttle
    /// interval (completion is always reported).
    pub fn update(&self, id: OperationId, done: u64, total: u64) {
        let snapshot = {
            let mut operations = self.operations.lock();
            let Some(op) = operations.get_mut(&id) else {
                return;
            };
            op.status.bytes_transferred = done;
            op.status.bytes_total = total;
            let now = Instant::now();
            let due = done >= total
                || op
                    .last_notified
                    .is_none_or(|last| now.duration_since(last) >= self.throttle);
            if !due {
                return;
            }
            op.last_notified = Some(now);
            op.status.clone()
        };
        self.observers.notify(|o| o.on_progress(&snapshot));
    }

    /// Progress callback that feeds `update` and stops the transfer once
    /// `token` is cancelled.
    pub fn progress_callback(
        self: &Arc<Self>,
        id: OperationId,
        token: CancellationToken,
    ) -> ProgressCallback {
        let registry = Arc::clone(self);
        Box::new(move |progress: &TransferProgress| {
            registry.update(id, progress.done, progress.total);
            !token.is_cancelled()
        })
    }

    /// Unregister `id` and deliver its terminal outcome.
    ///
    /// Returns `false` if the operation was no longer registered, which
    /// means it was cancelled and the outcome was already delivered.
    pub fn finish(&self, id: OperationId, outcome: TransferOutcome) -> bool {
        let Some(op) = self.operations.lock().remove(&id) else {
            return false;
        };
        debug!(operation_id = id, ?outcome, "operation finished");
        self.observers.notify(|o| o.on_finished(&op.status, &outcome));
        true
    }

    /// Cancel every operation on `virtual_path`. Returns whether any was found.
    pub fn cancel(&self, virtual_path: &str) -> bool {
        let cancelled: Vec<Operation> = {
            let mut operations = self.operations.lock();
            let ids: Vec<OperationId> = operations
                .iter()
                .filter(|(_, op)| op.status.virtual_path == virtual_path)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| operations.remove(id)).collect()
        };
        for op in &cancelled {
            op.token.cancel();
            info!(operation_id = op.status.operation_id, path = virtual_path, "operation cancelled");
            self.observers
                .notify(|o| o.on_finished(&op.status, &TransferOutcome::Cancelled));
        }
        !cancelled.is_empty()
    }

    /// Cancel everything still running.
    pub fn cancel_all(&self) {
        let paths: Vec<String> = self
            .operations
            .lock()
            .values()
            .map(|op| op.status.virtual_path.clone())
            .collect();
        for path in paths {
            self.cancel(&path);
        }
    }

    /// Snapshots of every registered operation, oldest first.
    pub fn list_in_progress(&self) -> Vec<ProgressStatus> {
        let mut list: Vec<ProgressStatus> = self
            .operations
            .lock()
            .values()
            .map(|op| op.status.clone())
            .collect();
        list.sort_by_key(|s| s.operation_id);
        list
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingOperations {
        pub(crate) progress: Mutex<Vec<u64>>,
        pub(crate) finished: Mutex<Vec<(OperationId, TransferOutcome)>>,
    }

    impl OperationObserver for RecordingOperations {
        fn on_progress(&self, status: &ProgressStatus) {
            self.progress.lock().push(status.bytes_transferred);
        }

        fn on_finished(&self, status: &ProgressStatus, outcome: &TransferOutcome) {
            self.finished
                .lock()
                .push((status.operation_id, outcome.clone()));
        }
    }

    fn registry(throttle_ms: u64) -> (Arc<OperationRegistry>, Arc<RecordingOperations>) {
        let registry = Arc::new(OperationRegistry::new(Duration::from_millis(throttle_ms)));
        let recorder = Arc::new(RecordingOperations::default());
        registry.add_observer(recorder.clone());
        (registry, recorder)
    }

    #[test]
    fn test_register_list_finish() {
        let (registry, recorder) = registry(0);
        let (a, _) = registry.register("/a.txt", TransferKind::Download, 10);
        let (b, _) = registry.register("/b.txt", TransferKind::Upload, 20);

        let listed = registry.list_in_progress();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].operation_id, a);
        assert_eq!(listed[1].kind, TransferKind::Upload);

        assert!(registry.finish(a, TransferOutcome::Completed));
        assert!(!registry.finish(a, TransferOutcome::Completed));
        assert_eq!(registry.list_in_progress().len(), 1);
        assert_eq!(
            *recorder.finished.lock(),
            vec![(a, TransferOutcome::Completed)]
        );
        registry.finish(b, TransferOutcome::Failed("boom".to_string()));
        assert!(registry.list_in_progress().is_empty());
    }

    #[test]
    fn test_cancel_delivers_outcome_once() {
        let (registry, recorder) = registry(0);
        let (id, token) = registry.register("/a.txt", TransferKind::Download, 10);

        assert!(registry.cancel("/a.txt"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("/a.txt"));
        assert!(!registry.finish(id, TransferOutcome::Completed));

        assert_eq!(
            *recorder.finished.lock(),
            vec![(id, TransferOutcome::Cancelled)]
        );
    }

    #[test]
    fn test_progress_is_throttled() {
        let (registry, recorder) = registry(60_000);
        let (id, token) = registry.register("/a.txt", TransferKind::Download, 100);
        let mut callback = registry.progress_callback(id, token);

        assert!(callback(&TransferProgress::new(10, 100, "a.txt")));
        assert!(callback(&TransferProgress::new(20, 100, "a.txt")));
        assert!(callback(&TransferProgress::new(100, 100, "a.txt")));

        assert_eq!(*recorder.progress.lock(), vec![10, 100]);
        assert_eq!(registry.list_in_progress()[0].bytes_transferred, 100);
    }

    #[test]
    fn test_callback_stops_after_cancel() {
        let (registry, _) = registry(0);
        let (id, token) = registry.register("/a.txt", TransferKind::Upload, 100);
        let mut callback = registry.progress_callback(id, token);

        assert!(callback(&TransferProgress::new(1, 100, "a.txt")));
        registry.cancel("/a.txt");
        assert!(!callback(&TransferProgress::new(2, 100, "a.txt")));
    }
}
