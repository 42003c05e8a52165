//! Copy, move and rename.

use tracing::{info, warn};

use super::super::{FileSystem, locate};
use crate::error::{FsError, Result};
use crate::fs::utils::{join_path, normalize_path, parent_and_name};
use crate::fs::{ContentOrigin, Node, parse_entry};

impl FileSystem {
    /// Copy the hosted document at `source` to `destination`.
    ///
    /// Regular files cannot be copied remotely and fail with
    /// [`FsError::InvalidOperation`].
    pub async fn copy(&self, source: &str, destination: &str) -> Result<Node> {
        let node = self.resolve(source).await?;
        let file = node
            .as_file()
            .ok_or_else(|| FsError::NotAFile(source.to_string()))?;
        if !file.is_hosted_document {
            return Err(FsError::InvalidOperation(format!(
                "{} is not a hosted document and cannot be copied",
                source
            )));
        }
        let dest = self.resolve_destination(destination).await?;

        let value = self
            .inner
            .service
            .copy_document(&node.resource_id, &dest.title)
            .await?;
        let entry = parse_entry(&value)?;

        // The copy lands in the root collection.
        if dest.parent.parent.is_some() {
            if let Err(err) = self
                .inner
                .service
                .add_to_parent(dest.parent.content_url(), &entry.edit_url)
                .await
            {
                warn!(
                    resource_id = %entry.resource_id,
                    error = %err,
                    "copy was created but left in the root collection"
                );
                self.mark_stale("");
                return Err(err);
            }
        }

        let (copied, parent_path) = {
            let mut tree = self.inner.tree.lock();
            let parent = locate(&tree, &dest.parent.resource_id)
                .ok_or_else(|| FsError::ParentNotFound(dest.path.clone()))?;
            let mut new_node = entry.to_new_node(ContentOrigin::FromServer);
            new_node.title = tree.unique_title(parent, &dest.title);
            let id = tree.add_child(parent, new_node)?;
            let copied = tree
                .get(id)
                .cloned()
                .ok_or_else(|| FsError::NotFound(dest.path.clone()))?;
            (copied, tree.path_of(parent))
        };

        info!(from = source, to = %dest.path, "copied document");
        if let Some(path) = parent_path {
            self.notify_directory_changed(&path);
        }
        Ok(copied)
    }

    /// Move the entry at `source` to `destination`, renaming it if the last
    /// segment differs.
    ///
    /// The tree changes only after every remote call succeeded. If the
    /// entry was added to its new directory but could not be removed from
    /// the old one, both directories are marked for refresh and the error
    /// is returned.
    pub async fn move_entry(&self, source: &str, destination: &str) -> Result<Node> {
        let source_path = normalize_path(source);
        let node = self.resolve(&source_path).await?;
        if node.parent.is_none() {
            return Err(FsError::InvalidOperation("cannot move the root".to_string()));
        }
        if normalize_path(destination) == source_path {
            return Ok(node);
        }
        let dest = self.resolve_destination(destination).await?;

        let old_parent = {
            let tree = self.inner.tree.lock();
            let id = locate(&tree, &node.resource_id)
                .ok_or_else(|| FsError::NotFound(source_path.clone()))?;
            let new_parent = locate(&tree, &dest.parent.resource_id)
                .ok_or_else(|| FsError::ParentNotFound(dest.path.clone()))?;
            if tree.is_ancestor(id, new_parent) {
                return Err(FsError::InvalidOperation(format!(
                    "cannot move {} into itself",
                    source_path
                )));
            }
            tree.get(id)
                .and_then(|n| n.parent)
                .and_then(|p| tree.get(p))
                .cloned()
                .ok_or_else(|| FsError::NotFound(source_path.clone()))?
        };

        let service = &self.inner.service;
        if dest.title != node.title {
            service.rename_entry(&node.edit_url, &dest.title).await?;
        }
        if old_parent.resource_id != dest.parent.resource_id {
            if dest.parent.parent.is_some() {
                if let Err(err) = service
                    .add_to_parent(dest.parent.content_url(), &node.edit_url)
                    .await
                {
                    if dest.title != node.title {
                        self.mark_stale(&old_parent.resource_id);
                    }
                    return Err(err);
                }
            }
            if old_parent.parent.is_some() {
                if let Err(err) = service
                    .remove_from_parent(old_parent.content_url(), &node.resource_id)
                    .await
                {
                    warn!(
                        resource_id = %node.resource_id,
                        error = %err,
                        "entry added to its new directory but not removed from the old one"
                    );
                    self.mark_stale(&old_parent.resource_id);
                    self.mark_stale(&dest.parent.resource_id);
                    return Err(err);
                }
            }
        }

        let (moved, old_dir, new_dir) = {
            let mut tree = self.inner.tree.lock();
            let id = locate(&tree, &node.resource_id)
                .ok_or_else(|| FsError::NotFound(source_path.clone()))?;
            let new_parent = locate(&tree, &dest.parent.resource_id)
                .ok_or_else(|| FsError::ParentNotFound(dest.path.clone()))?;
            let old_dir = tree
                .get(id)
                .and_then(|n| n.parent)
                .and_then(|p| tree.path_of(p));
            tree.move_node(id, new_parent, &dest.title)?;
            let moved = tree
                .get(id)
                .cloned()
                .ok_or_else(|| FsError::NotFound(dest.path.clone()))?;
            (moved, old_dir, tree.path_of(new_parent))
        };

        info!(from = %source_path, to = %dest.path, "moved entry");
        for path in [old_dir, new_dir].into_iter().flatten() {
            self.notify_directory_changed(&path);
        }
        Ok(moved)
    }

    /// Rename the entry at `path` within its directory.
    pub async fn rename(&self, path: &str, new_title: &str) -> Result<Node> {
        if new_title.is_empty() || new_title.contains('/') {
            return Err(FsError::InvalidOperation(format!(
                "invalid title {:?}",
                new_title
            )));
        }
        let (parent, _) = parent_and_name(path)
            .ok_or_else(|| FsError::InvalidOperation("cannot rename the root".to_string()))?;
        self.move_entry(path, &join_path(&parent, new_title)).await
    }
}

#[cfg(test)]
mod tests {
    use crate::api::{ServiceCall, ServiceError, ServiceErrorCode};
    use crate::error::FsError;
    use crate::filesystem::tests::fixture;

    #[tokio::test]
    async fn test_move_into_other_directory_with_new_title() {
        let f = fixture();
        let moved = f.fs.move_entry("/A/notes.txt", "/A/B/n2.txt").await.unwrap();
        assert_eq!(moved.title, "n2.txt");

        assert_eq!(f.service.parent_of("file:n").as_deref(), Some("folder:b"));
        assert_eq!(f.service.title_of("file:n").as_deref(), Some("n2.txt"));
        assert!(matches!(
            f.fs.find_entry_by_path("/A/notes.txt").await,
            Err(FsError::NotFound(_))
        ));
        let node = f.fs.find_entry_by_path("/A/B/n2.txt").await.unwrap();
        assert_eq!(node.resource_id, "file:n");
    }

    #[tokio::test]
    async fn test_move_to_root_and_rename() {
        let f = fixture();
        f.fs.move_entry("/A/B/c.txt", "/c.txt").await.unwrap();
        assert_eq!(f.service.parent_of("file:c"), None);
        assert_eq!(f.service.call_count(ServiceCall::AddToParent), 0);

        let renamed = f.fs.rename("/c.txt", "d.txt").await.unwrap();
        assert_eq!(renamed.title, "d.txt");
        assert_eq!(f.service.title_of("file:c").as_deref(), Some("d.txt"));
        assert!(f.fs.find_entry_by_path("/d.txt").await.is_ok());

        assert!(matches!(
            f.fs.rename("/d.txt", "x/y").await,
            Err(FsError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_move_validation() {
        let f = fixture();
        assert!(matches!(
            f.fs.move_entry("/A", "/A/B/A").await,
            Err(FsError::InvalidOperation(_))
        ));
        assert!(matches!(
            f.fs.move_entry("/A/notes.txt", "/A/B/c.txt").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            f.fs.move_entry("/A/notes.txt", "/X/y.txt").await,
            Err(FsError::ParentNotFound(_))
        ));
        assert!(matches!(
            f.fs.move_entry("/missing", "/y").await,
            Err(FsError::NotFound(_))
        ));
        assert_eq!(f.service.call_count(ServiceCall::RenameEntry), 0);
        assert_eq!(f.service.call_count(ServiceCall::AddToParent), 0);
    }

    #[tokio::test]
    async fn test_move_partial_failure_marks_directories_stale() {
        let f = fixture();
        f.fs.find_entry_by_path("/A/B").await.unwrap();
        f.service.fail_next(
            ServiceCall::RemoveFromParent,
            ServiceError::new(ServiceErrorCode::BadRequest, "refused"),
        );

        let err = f
            .fs
            .move_entry("/A/notes.txt", "/A/B/notes.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Network(_)));

        // The service already lists the entry under B; the stale directory
        // is refreshed on the next lookup.
        let node = f.fs.find_entry_by_path("/A/B/notes.txt").await.unwrap();
        assert_eq!(node.resource_id, "file:n");
    }

    #[tokio::test]
    async fn test_copy_hosted_document_into_directory() {
        let f = fixture();
        let copy = f.fs.copy("/Plan", "/A/Plan copy").await.unwrap();
        assert_eq!(copy.title, "Plan copy");
        assert!(copy.is_hosted_document());

        let rid = f.service.find_by_title("Plan copy").unwrap();
        assert_eq!(rid, copy.resource_id);
        assert_eq!(f.service.parent_of(&rid).as_deref(), Some("folder:a"));
        assert!(f.fs.find_entry_by_path("/Plan").await.is_ok());
        assert!(f.fs.find_entry_by_path("/A/Plan copy").await.is_ok());
    }

    #[tokio::test]
    async fn test_copy_rejects_files_and_directories() {
        let f = fixture();
        assert!(matches!(
            f.fs.copy("/A/notes.txt", "/A/n.txt").await,
            Err(FsError::InvalidOperation(_))
        ));
        assert!(matches!(
            f.fs.copy("/A", "/A2").await,
            Err(FsError::NotAFile(_))
        ));
        assert!(matches!(
            f.fs.copy("/Plan", "/A/notes.txt").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert_eq!(f.service.call_count(ServiceCall::CopyDocument), 0);
    }
}
