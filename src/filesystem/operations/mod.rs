//! Operation pipelines: copy, move, remove, create-directory, get-file and
//! upload.
//!
//! Every pipeline validates against the tree, calls the service, and only
//! then applies the change to the tree. Node ids are not held across
//! awaits; nodes are found again by resource id, since a root refresh
//! rebuilds the tree in between.

mod copy_move;
mod get_file;
mod mkdir;
mod remove;
mod upload;

pub use get_file::LocalFile;
pub use mkdir::FirstMissingParent;

use super::{FileSystem, locate};
use crate::error::{FsError, Result};
use crate::fs::utils::{normalize_path, parent_and_name};
use crate::fs::{ContentOrigin, Node, NodeId};

/// A validated, not yet existing destination path.
pub(crate) struct Destination {
    pub(crate) path: String,
    pub(crate) parent: Node,
    pub(crate) title: String,
}

impl FileSystem {
    /// Check that `path` names a free slot inside an existing directory.
    pub(crate) async fn resolve_destination(&self, path: &str) -> Result<Destination> {
        let path = normalize_path(path);
        let (parent_path, title) = parent_and_name(&path)
            .ok_or_else(|| FsError::AlreadyExists(path.clone()))?;

        let parent = match self.resolve(&parent_path).await {
            Ok(node) => node,
            Err(FsError::NotFound(_)) => return Err(FsError::ParentNotFound(parent_path)),
            Err(err) => return Err(err),
        };
        if !parent.is_directory() {
            return Err(FsError::NotADirectory(parent_path));
        }

        match self.resolve(&path).await {
            Ok(_) => Err(FsError::AlreadyExists(path)),
            Err(FsError::NotFound(_)) => Ok(Destination {
                path,
                parent,
                title,
            }),
            Err(err) => Err(err),
        }
    }

    /// Current id of `node` in the tree, found by resource id.
    pub(crate) fn current_id(&self, node: &Node) -> Result<NodeId> {
        let tree = self.inner.tree.lock();
        locate(&tree, &node.resource_id)
            .ok_or_else(|| FsError::NotFound(format!("entry {}", node.title)))
    }

    /// Mark the directory with `resource_id` as needing a refresh.
    pub(crate) fn mark_stale(&self, resource_id: &str) {
        let mut tree = self.inner.tree.lock();
        if let Some(id) = locate(&tree, resource_id) {
            let _ = tree.set_origin(id, ContentOrigin::FromCache);
        }
    }

    pub(crate) fn path_of_resource(&self, resource_id: &str) -> Option<String> {
        let tree = self.inner.tree.lock();
        locate(&tree, resource_id).and_then(|id| tree.path_of(id))
    }
}
