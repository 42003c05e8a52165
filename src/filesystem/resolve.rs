//! Path resolution.

use std::collections::HashSet;

use tracing::debug;

use super::refresh::{RefreshRequest, RefreshScope};
use super::{FileSystem, locate};
use crate::error::{FsError, Result};
use crate::fs::utils::normalize_path;
use crate::fs::{ContentOrigin, Node, PathLookup};

impl FileSystem {
    /// Look up the entry at `path`, loading feeds as needed.
    ///
    /// A directory whose listing came from the server is trusted: a missing
    /// child there is reported as [`FsError::NotFound`] without touching
    /// the network. Unloaded or cached directories are refreshed at most
    /// once per call before giving up.
    pub async fn find_entry_by_path(&self, path: &str) -> Result<Node> {
        self.resolve(path).await
    }

    /// Look up `path` in the tree as currently loaded, without refreshing.
    ///
    /// Blocks the calling thread on the tree lock; must not be called from
    /// an async task.
    pub fn find_entry_by_path_sync(&self, path: &str) -> Result<Node> {
        self.ensure_running()?;
        let path = normalize_path(path);
        let tree = self.inner.tree.lock();
        match tree.find_by_path(&path) {
            PathLookup::Found(id) => tree
                .get(id)
                .cloned()
                .ok_or_else(|| FsError::NotFound(path.clone())),
            PathLookup::Missing { .. } => Err(FsError::NotFound(path)),
            PathLookup::NotADirectory(_) => Err(FsError::NotADirectory(path)),
        }
    }

    /// Children of the directory at `path`, ordered by title.
    pub async fn read_directory(&self, path: &str) -> Result<Vec<Node>> {
        let node = self.resolve(path).await?;
        let dir = node
            .as_directory()
            .ok_or_else(|| FsError::NotADirectory(path.to_string()))?;

        match (node.parent.is_none(), dir.origin) {
            (_, ContentOrigin::FromServer) => {}
            (true, ContentOrigin::Initializing) => {
                self.refresh(RefreshRequest::bootstrap_root()).await?
            }
            (true, _) => self.refresh(RefreshRequest::network(RefreshScope::Root)).await?,
            (false, _) => {
                self.refresh(RefreshRequest::network(RefreshScope::Directory(
                    node.resource_id.clone(),
                )))
                .await?
            }
        }

        let tree = self.inner.tree.lock();
        let id = locate(&tree, &node.resource_id)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(tree.children(id).into_iter().cloned().collect())
    }

    /// Reload the directory at `path` from the service.
    pub async fn refresh_directory(&self, path: &str) -> Result<()> {
        let node = self.resolve(path).await?;
        if !node.is_directory() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        let scope = if node.parent.is_none() {
            RefreshScope::Root
        } else {
            RefreshScope::Directory(node.resource_id.clone())
        };
        self.refresh(RefreshRequest::network(scope)).await
    }

    /// Resolve `path` to a snapshot of its node.
    pub(crate) async fn resolve(&self, path: &str) -> Result<Node> {
        self.ensure_running()?;
        let path = normalize_path(path);
        let mut attempted: HashSet<RefreshRequest> = HashSet::new();

        loop {
            let request = {
                let tree = self.inner.tree.lock();
                match tree.find_by_path(&path) {
                    PathLookup::Found(id) => {
                        return tree
                            .get(id)
                            .cloned()
                            .ok_or_else(|| FsError::NotFound(path.clone()));
                    }
                    PathLookup::NotADirectory(_) => return Err(FsError::NotADirectory(path)),
                    PathLookup::Missing { dir, .. } => {
                        let root = tree.root();
                        let root_origin = tree.origin(root);
                        let dir_origin = tree.origin(dir);
                        if root_origin == Some(ContentOrigin::Initializing) {
                            RefreshRequest::bootstrap_root()
                        } else if dir_origin == Some(ContentOrigin::FromServer) {
                            return Err(FsError::NotFound(path));
                        } else if dir == root {
                            RefreshRequest::network(RefreshScope::Root)
                        } else {
                            let resource_id = tree
                                .get(dir)
                                .map(|n| n.resource_id.clone())
                                .unwrap_or_default();
                            RefreshRequest::network(RefreshScope::Directory(resource_id))
                        }
                    }
                }
            };

            if !attempted.insert(request.clone()) {
                return Err(FsError::NotFound(path));
            }
            debug!(path = %path, ?request, "path not loaded, refreshing");
            self.refresh(request).await?;
        }
    }
}
