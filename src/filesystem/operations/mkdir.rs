use tracing::debug;

use super::super::{FileSystem, locate};
use crate::error::{FsError, Result};
use crate::fs::utils::{normalize_path, parent_and_name, split_path};
use crate::fs::{ContentOrigin, Node, PathLookup, parse_entry};

/// How much of a directory path already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstMissingParent {
    /// The whole path exists.
    Found(Node),
    /// `parent` is the deepest existing directory and `first_missing` the
    /// path of its missing child. `remaining` counts the missing segments.
    Missing {
        parent: Node,
        first_missing: String,
        remaining: usize,
    },
    /// The named segment is a file.
    Invalid(String),
}

impl FileSystem {
    /// Find the first segment of `path` that does not exist.
    pub async fn find_first_missing_parent(&self, path: &str) -> Result<FirstMissingParent> {
        let path = normalize_path(path);
        match self.resolve(&path).await {
            Ok(node) => return Ok(FirstMissingParent::Found(node)),
            Err(FsError::NotFound(_)) => {}
            Err(FsError::NotADirectory(p)) => return Ok(FirstMissingParent::Invalid(p)),
            Err(err) => return Err(err),
        }

        let tree = self.inner.tree.lock();
        match tree.find_by_path(&path) {
            PathLookup::Found(id) => tree
                .get(id)
                .cloned()
                .map(FirstMissingParent::Found)
                .ok_or(FsError::NotFound(path)),
            PathLookup::NotADirectory(id) => Ok(FirstMissingParent::Invalid(
                tree.path_of(id).unwrap_or(path),
            )),
            PathLookup::Missing { dir, missing } => {
                let segments = split_path(&path);
                let parent = tree
                    .get(dir)
                    .cloned()
                    .ok_or_else(|| FsError::NotFound(path.clone()))?;
                Ok(FirstMissingParent::Missing {
                    parent,
                    first_missing: format!("/{}", segments[..=missing].join("/")),
                    remaining: segments.len() - missing,
                })
            }
        }
    }

    /// Create the directory at `path`.
    ///
    /// With `exclusive`, an existing directory is an error; otherwise it is
    /// returned as is. Without `recursive`, the parent must already exist.
    pub async fn create_directory(
        &self,
        path: &str,
        exclusive: bool,
        recursive: bool,
    ) -> Result<Node> {
        let path = normalize_path(path);
        match self.find_first_missing_parent(&path).await? {
            FirstMissingParent::Found(_) if exclusive => Err(FsError::AlreadyExists(path)),
            FirstMissingParent::Found(node) if node.is_directory() => Ok(node),
            FirstMissingParent::Found(_) => Err(FsError::NotADirectory(path)),
            FirstMissingParent::Invalid(p) => Err(FsError::NotADirectory(p)),
            FirstMissingParent::Missing {
                parent, remaining, ..
            } => {
                if remaining > 1 && !recursive {
                    let parent_path = parent_and_name(&path)
                        .map(|(p, _)| p)
                        .unwrap_or_else(|| "/".to_string());
                    return Err(FsError::ParentNotFound(parent_path));
                }
                let segments = split_path(&path);
                let mut current = parent;
                for title in &segments[segments.len() - remaining..] {
                    current = self.create_child_directory(&current, title).await?;
                }
                Ok(current)
            }
        }
    }

    async fn create_child_directory(&self, parent: &Node, title: &str) -> Result<Node> {
        let value = self
            .inner
            .service
            .create_directory(parent.content_url(), title)
            .await?;
        let entry = parse_entry(&value)?;

        let (created, parent_path) = {
            let mut tree = self.inner.tree.lock();
            let parent_id = locate(&tree, &parent.resource_id)
                .ok_or_else(|| FsError::ParentNotFound(parent.title.clone()))?;
            let mut new_node = entry.to_new_node(ContentOrigin::FromServer);
            new_node.title = title.to_string();
            let id = tree.add_child(parent_id, new_node)?;
            let created = tree
                .get(id)
                .cloned()
                .ok_or_else(|| FsError::NotFound(title.to_string()))?;
            (created, tree.path_of(parent_id))
        };

        debug!(resource_id = %created.resource_id, title, "created directory");
        if let Some(path) = parent_path {
            self.notify_directory_changed(&path);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ServiceCall;
    use crate::filesystem::tests::fixture;

    #[tokio::test]
    async fn test_recursive_create_then_repeat_is_noop() {
        let f = fixture();
        let created = f.fs.create_directory("/X/Y/Z", false, true).await.unwrap();
        assert_eq!(created.title, "Z");
        assert_eq!(f.service.call_count(ServiceCall::CreateDirectory), 3);
        assert!(f.service.contains(&created.resource_id));

        let again = f.fs.create_directory("/X/Y/Z", false, true).await.unwrap();
        assert_eq!(again.resource_id, created.resource_id);
        assert_eq!(f.service.call_count(ServiceCall::CreateDirectory), 3);

        assert_eq!(
            f.fs.create_directory("/X/Y/Z", true, true).await,
            Err(FsError::AlreadyExists("/X/Y/Z".to_string()))
        );
    }

    #[tokio::test]
    async fn test_non_recursive_create_needs_parent() {
        let f = fixture();
        assert_eq!(
            f.fs.create_directory("/P/Q", false, false).await,
            Err(FsError::ParentNotFound("/P".to_string()))
        );
        assert_eq!(f.service.call_count(ServiceCall::CreateDirectory), 0);

        let made = f.fs.create_directory("/A/New", true, false).await.unwrap();
        assert_eq!(f.service.parent_of(&made.resource_id).as_deref(), Some("folder:a"));
        assert!(f.fs.read_directory("/A/New").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_first_missing_parent() {
        let f = fixture();
        match f.fs.find_first_missing_parent("/A/B/x/y").await.unwrap() {
            FirstMissingParent::Missing {
                parent,
                first_missing,
                remaining,
            } => {
                assert_eq!(parent.resource_id, "folder:b");
                assert_eq!(first_missing, "/A/B/x");
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            f.fs.find_first_missing_parent("/A/B").await.unwrap(),
            FirstMissingParent::Found(_)
        ));
        assert!(matches!(
            f.fs.find_first_missing_parent("/A/notes.txt/x").await.unwrap(),
            FirstMissingParent::Invalid(_)
        ));
        assert!(matches!(
            f.fs.create_directory("/A/notes.txt", false, false).await,
            Err(FsError::NotADirectory(_))
        ));
    }
}
