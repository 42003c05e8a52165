//! Change notifications for file system consumers.

use std::sync::Arc;

use parking_lot::Mutex;

/// Receives notifications about cache and tree changes.
///
/// Callbacks run on whatever task caused the change and must not block.
pub trait FileSystemObserver: Send + Sync {
    fn on_file_pinned(&self, _resource_id: &str, _content_hash: &str) {}

    fn on_file_unpinned(&self, _resource_id: &str, _content_hash: &str) {}

    /// Children of the directory at `path` changed.
    fn on_directory_changed(&self, _path: &str) {}
}

/// A shared list of observers that is never locked while notifying.
pub(crate) struct ObserverList<T: ?Sized> {
    observers: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ObserverList<T> {
    pub(crate) fn add(&self, observer: Arc<T>) {
        self.observers.lock().push(observer);
    }

    /// Remove `observer`, compared by identity.
    pub(crate) fn remove(&self, observer: &Arc<T>) {
        self.observers
            .lock()
            .retain(|o| !std::ptr::addr_eq(Arc::as_ptr(o), Arc::as_ptr(observer)));
    }

    pub(crate) fn notify(&self, f: impl Fn(&T)) {
        let snapshot: Vec<Arc<T>> = self.observers.lock().clone();
        for observer in &snapshot {
            f(&**observer);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every notification as a string.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) events: Mutex<Vec<String>>,
    }

    impl FileSystemObserver for RecordingObserver {
        fn on_file_pinned(&self, resource_id: &str, content_hash: &str) {
            self.events
                .lock()
                .push(format!("pinned {} {}", resource_id, content_hash));
        }

        fn on_file_unpinned(&self, resource_id: &str, content_hash: &str) {
            self.events
                .lock()
                .push(format!("unpinned {} {}", resource_id, content_hash));
        }

        fn on_directory_changed(&self, path: &str) {
            self.events.lock().push(format!("changed {}", path));
        }
    }

    #[test]
    fn test_add_notify_remove() {
        let list: ObserverList<dyn FileSystemObserver> = ObserverList::default();
        let recorder = Arc::new(RecordingObserver::default());
        let observer: Arc<dyn FileSystemObserver> = recorder.clone();

        list.add(observer.clone());
        list.notify(|o| o.on_directory_changed("/A"));
        list.remove(&observer);
        list.notify(|o| o.on_directory_changed("/B"));

        assert_eq!(*recorder.events.lock(), vec!["changed /A".to_string()]);
    }
}
