//! Feed refreshes.
//!
//! A refresh loads a feed and applies it to the tree. Refreshes are keyed
//! by scope and source; a caller asking for one that is already running
//! waits for its result instead of fetching again. The leader runs on its
//! own task, so a caller dropping its future never strands the others.

use tracing::{debug, info, warn};

use super::{FileSystem, locate};
use crate::error::{FsError, Result};
use crate::fs::feed::{build_root_tree, merge_directory_listing};
use crate::fs::{ContentOrigin, FeedEntry, FeedPage, parse_feed_page};

/// What a refresh reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshScope {
    /// The whole account, from the root feed.
    Root,
    /// The direct children of the directory with this resource id.
    Directory(String),
}

/// Steps of a refresh, logged as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Init,
    LoadingCacheFeed,
    ApplyingCacheFeed,
    LoadingNetworkFeed,
    ApplyingNetworkFeed,
    PersistingFeed,
    Done,
}

impl RefreshState {
    fn advance(&mut self, next: RefreshState, scope: &RefreshScope) {
        debug!(?scope, from = ?*self, to = ?next, "refresh");
        *self = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FeedSource {
    /// Apply the on-disk snapshot only.
    CacheOnly,
    /// Use the snapshot if there is one, otherwise the network.
    PreferCache,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RefreshRequest {
    pub(crate) scope: RefreshScope,
    pub(crate) source: FeedSource,
}

impl RefreshRequest {
    pub(crate) fn cached_root() -> Self {
        Self {
            scope: RefreshScope::Root,
            source: FeedSource::CacheOnly,
        }
    }

    pub(crate) fn bootstrap_root() -> Self {
        Self {
            scope: RefreshScope::Root,
            source: FeedSource::PreferCache,
        }
    }

    pub(crate) fn network(scope: RefreshScope) -> Self {
        Self {
            scope,
            source: FeedSource::Network,
        }
    }
}

impl FileSystem {
    /// Run `request`, or wait for the identical refresh already running.
    pub(crate) async fn refresh(&self, request: RefreshRequest) -> Result<()> {
        self.ensure_running()?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let leader = {
            let mut inflight = self.inner.refreshes.lock();
            match inflight.get_mut(&request) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    inflight.insert(request.clone(), vec![tx]);
                    true
                }
            }
        };

        if leader {
            let fs = self.clone();
            tokio::spawn(async move {
                let result = fs.run_refresh(&request).await;
                let waiters = fs
                    .inner
                    .refreshes
                    .lock()
                    .remove(&request)
                    .unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        } else {
            debug!(?request, "joining refresh in flight");
        }

        rx.await.map_err(|_| FsError::Stopped)?
    }

    async fn run_refresh(&self, request: &RefreshRequest) -> Result<()> {
        match &request.scope {
            RefreshScope::Root => self.refresh_root(request.source).await,
            RefreshScope::Directory(resource_id) => self.refresh_directory_feed(resource_id).await,
        }
    }

    async fn refresh_root(&self, source: FeedSource) -> Result<()> {
        let scope = RefreshScope::Root;
        let mut state = RefreshState::Init;

        let mut origin = self.root_origin();
        if origin == ContentOrigin::Initializing {
            state.advance(RefreshState::LoadingCacheFeed, &scope);
            match self.inner.meta.load_root_feed().await {
                Ok(Some(page)) => {
                    state.advance(RefreshState::ApplyingCacheFeed, &scope);
                    self.apply_root_feed(&page.entries, ContentOrigin::FromCache);
                    origin = ContentOrigin::FromCache;
                }
                Ok(None) => debug!("no root feed snapshot"),
                Err(err) => warn!(error = %err, "discarding unreadable root feed snapshot"),
            }
        }

        let wants_network = match source {
            FeedSource::CacheOnly => false,
            FeedSource::PreferCache => origin == ContentOrigin::Initializing,
            FeedSource::Network => true,
        };
        if !wants_network {
            state.advance(RefreshState::Done, &scope);
            return Ok(());
        }

        state.advance(RefreshState::LoadingNetworkFeed, &scope);
        let entries = match self.fetch_feed_entries(None).await {
            Ok(entries) => entries,
            Err(err) if origin != ContentOrigin::Initializing && err != FsError::Stopped => {
                warn!(error = %err, "root feed unavailable, keeping cached tree");
                state.advance(RefreshState::Done, &scope);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        state.advance(RefreshState::ApplyingNetworkFeed, &scope);
        self.apply_root_feed(&entries, ContentOrigin::FromServer);

        state.advance(RefreshState::PersistingFeed, &scope);
        let page = FeedPage {
            entries,
            next: None,
        };
        if let Err(err) = self.inner.meta.save_root_feed(page).await {
            warn!(error = %err, "failed to persist root feed snapshot");
        }
        state.advance(RefreshState::Done, &scope);
        Ok(())
    }

    async fn refresh_directory_feed(&self, resource_id: &str) -> Result<()> {
        let scope = RefreshScope::Directory(resource_id.to_string());
        let mut state = RefreshState::Init;

        let (content_url, origin) = {
            let tree = self.inner.tree.lock();
            let dir = locate(&tree, resource_id)
                .and_then(|id| tree.get(id))
                .and_then(|node| node.as_directory())
                .ok_or_else(|| FsError::NotFound(format!("directory {}", resource_id)))?;
            (dir.content_url.clone(), dir.origin)
        };

        state.advance(RefreshState::LoadingNetworkFeed, &scope);
        let entries = match self.fetch_feed_entries(Some(&content_url)).await {
            Ok(entries) => entries,
            Err(err) if origin == ContentOrigin::FromCache && err != FsError::Stopped => {
                warn!(resource_id, error = %err, "directory feed unavailable, keeping cached listing");
                state.advance(RefreshState::Done, &scope);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        state.advance(RefreshState::ApplyingNetworkFeed, &scope);
        let path = {
            let mut tree = self.inner.tree.lock();
            let id = locate(&tree, resource_id)
                .ok_or_else(|| FsError::NotFound(format!("directory {}", resource_id)))?;
            merge_directory_listing(&mut tree, id, &entries, ContentOrigin::FromServer)?;
            tree.path_of(id)
        };
        state.advance(RefreshState::Done, &scope);

        if let Some(path) = path {
            self.notify_directory_changed(&path);
        }
        Ok(())
    }

    /// Fetch every page of a feed. Nothing is applied until all pages
    /// parsed.
    async fn fetch_feed_entries(&self, first: Option<&str>) -> Result<Vec<FeedEntry>> {
        let max_pages = self.inner.config.max_feed_pages.max(1);
        let mut entries = Vec::new();
        let mut url = first.map(str::to_string);

        for pages in 1..=max_pages {
            let value = self.inner.service.fetch_feed(url.as_deref()).await?;
            let page = parse_feed_page(&value)?;
            entries.extend(page.entries);
            match page.next {
                Some(next) => url = Some(next),
                None => {
                    debug!(pages, entries = entries.len(), "feed fetched");
                    return Ok(entries);
                }
            }
        }
        Err(FsError::ValidationError(format!(
            "feed did not end within {} pages",
            max_pages
        )))
    }

    fn apply_root_feed(&self, entries: &[FeedEntry], origin: ContentOrigin) {
        let stats = {
            let mut tree = self.inner.tree.lock();
            let (fresh, stats) = build_root_tree(&tree, entries, origin);
            *tree = fresh;
            stats
        };
        info!(
            ?origin,
            added = stats.added,
            skipped = stats.skipped,
            "applied root feed"
        );
        self.notify_directory_changed("/");
    }

    pub(super) fn root_origin(&self) -> ContentOrigin {
        let tree = self.inner.tree.lock();
        tree.origin(tree.root())
            .unwrap_or(ContentOrigin::Initializing)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::memory::ServiceCall;
    use crate::api::{MemoryDocumentService, ServiceError, ServiceErrorCode};
    use crate::filesystem::tests::{config_in, fixture, fixture_with};
    use crate::observer::tests::RecordingObserver;

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_refresh() {
        let f = fixture();
        let (a, b) = tokio::join!(
            f.fs.find_entry_by_path("/A/B/c.txt"),
            f.fs.find_entry_by_path("/A/notes.txt")
        );
        assert_eq!(a.unwrap().resource_id, "file:c");
        assert_eq!(b.unwrap().resource_id, "file:n");
        assert_eq!(f.service.call_count(ServiceCall::FetchFeed), 1);
    }

    #[tokio::test]
    async fn test_paginated_feed_is_followed() {
        let f = fixture();
        f.service.set_page_size(2);
        let node = f.fs.find_entry_by_path("/A/B/c.txt").await.unwrap();
        assert_eq!(node.resource_id, "file:c");
        // Five entries in pages of two.
        assert_eq!(f.service.call_count(ServiceCall::FetchFeed), 3);
        assert_eq!(f.fs.root_origin(), ContentOrigin::FromServer);
    }

    #[tokio::test]
    async fn test_network_failure_without_snapshot_is_reported() {
        let f = fixture();
        f.service.fail_next(
            ServiceCall::FetchFeed,
            ServiceError::new(ServiceErrorCode::BadRequest, "nope"),
        );
        let err = f.fs.find_entry_by_path("/A").await.unwrap_err();
        assert!(matches!(err, FsError::Network(_)));
        assert_eq!(f.fs.root_origin(), ContentOrigin::Initializing);

        // The next lookup tries again.
        assert!(f.fs.find_entry_by_path("/A").await.is_ok());
    }

    #[tokio::test]
    async fn test_offline_bootstrap_from_snapshot() {
        let f = fixture();
        f.fs.find_entry_by_path("/A/B/c.txt").await.unwrap();
        f.fs.shutdown().await;

        // A second instance over the same cache with an unreachable service.
        let offline = Arc::new(MemoryDocumentService::new());
        for _ in 0..2 {
            offline.fail_next(
                ServiceCall::FetchFeed,
                ServiceError::new(ServiceErrorCode::Forbidden, "offline"),
            );
        }
        let fs = FileSystem::new(offline.clone(), config_in(&f.dir));
        let recorder = Arc::new(RecordingObserver::default());
        fs.add_observer(recorder.clone());

        fs.initialize().await.unwrap();
        assert_eq!(fs.root_origin(), ContentOrigin::FromCache);
        assert!(recorder.events.lock().contains(&"changed /".to_string()));

        let node = fs.find_entry_by_path("/A/B/c.txt").await.unwrap();
        assert_eq!(node.resource_id, "file:c");
        assert_eq!(offline.call_count(ServiceCall::FetchFeed), 0);

        // A miss in a cached directory asks the network once, then gives up.
        assert!(matches!(
            fs.find_entry_by_path("/A/missing.txt").await,
            Err(FsError::NotFound(_))
        ));
        assert_eq!(offline.call_count(ServiceCall::FetchFeed), 1);
    }

    #[tokio::test]
    async fn test_refresh_directory_picks_up_remote_additions() {
        let f = fixture();
        f.fs.find_entry_by_path("/A").await.unwrap();
        f.service
            .add_file("file:new", "new.txt", Some("folder:a"), b"fresh");

        // Known directories are trusted until refreshed.
        assert!(matches!(
            f.fs.find_entry_by_path("/A/new.txt").await,
            Err(FsError::NotFound(_))
        ));

        f.fs.refresh_directory("/A").await.unwrap();
        let node = f.fs.find_entry_by_path("/A/new.txt").await.unwrap();
        assert_eq!(node.resource_id, "file:new");
        assert_eq!(
            f.fs.find_entry_by_path("/A/B/c.txt").await.unwrap().resource_id,
            "file:c"
        );
    }

    #[tokio::test]
    async fn test_initialize_without_snapshot_stays_offline() {
        let service = Arc::new(MemoryDocumentService::new());
        let f = fixture_with(service);
        f.fs.initialize().await.unwrap();
        assert_eq!(f.service.call_count(ServiceCall::FetchFeed), 0);
        assert_eq!(f.fs.root_origin(), ContentOrigin::Initializing);
    }
}
