use std::collections::HashSet;

use tracing::{info, warn};

use super::super::locate;
use super::super::refresh::{RefreshRequest, RefreshScope};
use crate::error::{FsError, Result};
use crate::filesystem::FileSystem;
use crate::fs::ContentOrigin;

impl FileSystem {
    /// Delete the entry at `path`.
    ///
    /// A non-empty directory is only deleted with `recursive`. Cached
    /// content of every removed file is dropped as well.
    pub async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let node = self.resolve(path).await?;
        if node.parent.is_none() {
            return Err(FsError::InvalidOperation("cannot remove the root".to_string()));
        }

        if let Some(dir) = node.as_directory() {
            if recursive {
                self.load_subtree(&node.resource_id).await;
            } else {
                // Children of an unloaded directory are not known yet.
                if dir.origin != ContentOrigin::FromServer {
                    self.refresh(RefreshRequest::network(RefreshScope::Directory(
                        node.resource_id.clone(),
                    )))
                    .await?;
                }
                let has_children = {
                    let tree = self.inner.tree.lock();
                    locate(&tree, &node.resource_id)
                        .is_some_and(|id| !tree.children(id).is_empty())
                };
                if has_children {
                    return Err(FsError::DirectoryNotEmpty(path.to_string()));
                }
            }
        }

        self.inner.service.delete_entry(&node.edit_url).await?;

        let (removed, parent_path) = {
            let mut tree = self.inner.tree.lock();
            match locate(&tree, &node.resource_id) {
                Some(id) => {
                    let parent_path = tree
                        .get(id)
                        .and_then(|n| n.parent)
                        .and_then(|p| tree.path_of(p));
                    (Some(tree.remove(id)?), parent_path)
                }
                None => (None, None),
            }
        };

        let files = removed
            .as_ref()
            .map(|subtree| subtree.file_resource_ids())
            .unwrap_or_default();
        for resource_id in &files {
            if let Err(err) = self.inner.cache.remove(resource_id).await {
                warn!(resource_id = %resource_id, error = %err, "failed to drop cached content");
            }
        }

        info!(path, files = files.len(), "removed entry");
        if let Some(parent_path) = parent_path {
            self.notify_directory_changed(&parent_path);
        }
        Ok(())
    }

    /// List every directory below `resource_id` that was never loaded, so
    /// the files the removal takes along are all known.
    async fn load_subtree(&self, resource_id: &str) {
        let mut attempted = HashSet::new();
        loop {
            let unloaded: Vec<String> = {
                let tree = self.inner.tree.lock();
                let Some(top) = locate(&tree, resource_id) else {
                    return;
                };
                let mut pending = vec![top];
                let mut unloaded = Vec::new();
                while let Some(id) = pending.pop() {
                    if tree.origin(id).is_some_and(|o| o != ContentOrigin::FromServer) {
                        if let Some(node) = tree.get(id) {
                            if attempted.insert(node.resource_id.clone()) {
                                unloaded.push(node.resource_id.clone());
                            }
                        }
                    }
                    pending.extend(
                        tree.children(id)
                            .iter()
                            .filter(|c| c.is_directory())
                            .map(|c| c.id),
                    );
                }
                unloaded
            };
            if unloaded.is_empty() {
                return;
            }
            for rid in unloaded {
                let request = RefreshRequest::network(RefreshScope::Directory(rid.clone()));
                if let Err(err) = self.refresh(request).await {
                    warn!(resource_id = %rid, error = %err, "cannot list directory before removal");
                }
            }
        }
    }
}
