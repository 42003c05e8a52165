//! In-memory directory tree.
//!
//! All nodes live in one arena owned by [`DirectoryTree`]. Directories own
//! their children through a title map of [`NodeId`]s and children refer back
//! through a plain `parent` id, so there is no shared ownership anywhere.
//! A resource-id index is kept in step with every insertion and removal.

use std::collections::HashMap;

use super::node::{ContentOrigin, DirectoryNode, FileInfo, Node, NodeId, NodeKind};
use super::utils::split_path;
use crate::error::{FsError, Result};

/// Node contents before the node is placed in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub title: String,
    pub resource_id: String,
    pub edit_url: String,
    pub file_info: FileInfo,
    pub kind: NodeKind,
}

/// Outcome of walking a path from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLookup {
    Found(NodeId),
    /// `dir` is the deepest directory reached and `missing` the index of
    /// the first path segment it does not contain.
    Missing { dir: NodeId, missing: usize },
    /// A segment before the last one names a file.
    NotADirectory(NodeId),
}

/// Nodes detached from the tree by a removal, in pre-order.
#[derive(Debug, Clone)]
pub struct RemovedSubtree {
    nodes: Vec<Node>,
}

impl RemovedSubtree {
    /// The node that was detached.
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Resource ids of every file in the subtree.
    pub fn file_resource_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.is_file() && !n.resource_id.is_empty())
            .map(|n| n.resource_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryTree {
    nodes: HashMap<NodeId, Node>,
    by_resource_id: HashMap<String, NodeId>,
    root: NodeId,
    next_id: u64,
}

impl DirectoryTree {
    /// Create a tree holding only an unloaded root directory.
    pub fn new(root_content_url: &str, root_upload_url: &str) -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                id: root,
                title: String::new(),
                parent: None,
                resource_id: String::new(),
                edit_url: String::new(),
                file_info: FileInfo::default(),
                kind: NodeKind::Directory(DirectoryNode::new(root_content_url, root_upload_url)),
            },
        );
        Self {
            nodes,
            by_resource_id: HashMap::new(),
            root,
            next_id: 1,
        }
    }

    /// An empty tree with the same root locators that never reissues an id
    /// handed out by `self`.
    pub fn empty_like(&self) -> Self {
        let (content_url, upload_url) = self
            .get(self.root)
            .and_then(Node::as_directory)
            .map(|d| (d.content_url.clone(), d.upload_url.clone()))
            .unwrap_or_default();
        let mut fresh = Self::new(&content_url, &upload_url);
        fresh.next_id = self.next_id;
        fresh
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn find_by_resource_id(&self, resource_id: &str) -> Option<NodeId> {
        self.by_resource_id.get(resource_id).copied()
    }

    fn directory(&self, id: NodeId) -> Result<&DirectoryNode> {
        let node = self
            .get(id)
            .ok_or_else(|| FsError::NotFound(format!("node {:?}", id)))?;
        node.as_directory()
            .ok_or_else(|| FsError::NotADirectory(node.title.clone()))
    }

    fn directory_mut(&mut self, id: NodeId) -> Result<&mut DirectoryNode> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("node {:?}", id)))?;
        let title = node.title.clone();
        node.as_directory_mut()
            .ok_or(FsError::NotADirectory(title))
    }

    /// Child of `dir` titled `title`.
    pub fn child(&self, dir: NodeId, title: &str) -> Option<NodeId> {
        self.directory(dir).ok()?.children.get(title).copied()
    }

    /// Children of `dir`, ordered by title.
    pub fn children(&self, dir: NodeId) -> Vec<&Node> {
        match self.directory(dir) {
            Ok(d) => d.children.values().filter_map(|id| self.get(*id)).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn origin(&self, dir: NodeId) -> Option<ContentOrigin> {
        self.directory(dir).ok().map(|d| d.origin)
    }

    pub fn set_origin(&mut self, dir: NodeId, origin: ContentOrigin) -> Result<()> {
        self.directory_mut(dir)?.origin = origin;
        Ok(())
    }

    /// Insert `node` under `parent`.
    ///
    /// Fails with `AlreadyExists` if `parent` already has a child with the
    /// same title or the resource id is already in the tree.
    pub fn add_child(&mut self, parent: NodeId, node: NewNode) -> Result<NodeId> {
        if self.directory(parent)?.children.contains_key(&node.title) {
            return Err(FsError::AlreadyExists(node.title));
        }
        if !node.resource_id.is_empty() && self.by_resource_id.contains_key(&node.resource_id) {
            return Err(FsError::AlreadyExists(node.resource_id));
        }

        let id = NodeId(self.next_id);
        self.next_id += 1;
        if !node.resource_id.is_empty() {
            self.by_resource_id.insert(node.resource_id.clone(), id);
        }
        self.directory_mut(parent)?
            .children
            .insert(node.title.clone(), id);
        self.nodes.insert(
            id,
            Node {
                id,
                title: node.title,
                parent: Some(parent),
                resource_id: node.resource_id,
                edit_url: node.edit_url,
                file_info: node.file_info,
                kind: node.kind,
            },
        );
        Ok(id)
    }

    /// Detach the child titled `title` and everything below it.
    pub fn remove_child(&mut self, parent: NodeId, title: &str) -> Result<RemovedSubtree> {
        let id = self
            .directory_mut(parent)?
            .children
            .remove(title)
            .ok_or_else(|| FsError::NotFound(title.to_string()))?;

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                if !node.resource_id.is_empty() {
                    self.by_resource_id.remove(&node.resource_id);
                }
                if let Some(dir) = node.as_directory() {
                    stack.extend(dir.children.values().rev().copied());
                }
                removed.push(node);
            }
        }
        Ok(RemovedSubtree { nodes: removed })
    }

    /// Detach node `id` from wherever it is.
    pub fn remove(&mut self, id: NodeId) -> Result<RemovedSubtree> {
        let node = self
            .get(id)
            .ok_or_else(|| FsError::NotFound(format!("node {:?}", id)))?;
        let parent = node
            .parent
            .ok_or_else(|| FsError::InvalidOperation("cannot remove the root".to_string()))?;
        let title = node.title.clone();
        self.remove_child(parent, &title)
    }

    /// Check whether `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == ancestor {
                return true;
            }
            current = self.get(cur).and_then(|n| n.parent);
        }
        false
    }

    /// Move `id` under `new_parent` with title `new_title`.
    ///
    /// Covers plain renames (same parent) as well.
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId, new_title: &str) -> Result<()> {
        let node = self
            .get(id)
            .ok_or_else(|| FsError::NotFound(format!("node {:?}", id)))?;
        let old_parent = node
            .parent
            .ok_or_else(|| FsError::InvalidOperation("cannot move the root".to_string()))?;
        let old_title = node.title.clone();

        if old_parent == new_parent && old_title == new_title {
            return Ok(());
        }
        if self.is_ancestor(id, new_parent) {
            return Err(FsError::InvalidOperation(format!(
                "cannot move {} into itself",
                old_title
            )));
        }
        if self.directory(new_parent)?.children.contains_key(new_title) {
            return Err(FsError::AlreadyExists(new_title.to_string()));
        }

        self.directory_mut(old_parent)?.children.remove(&old_title);
        self.directory_mut(new_parent)?
            .children
            .insert(new_title.to_string(), id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(new_parent);
            node.title = new_title.to_string();
        }
        Ok(())
    }

    /// Walk `path` from the root, matching titles segment by segment.
    pub fn find_by_path(&self, path: &str) -> PathLookup {
        let mut current = self.root;
        for (index, segment) in split_path(path).into_iter().enumerate() {
            let Ok(dir) = self.directory(current) else {
                return PathLookup::NotADirectory(current);
            };
            match dir.children.get(segment) {
                Some(child) => current = *child,
                None => {
                    return PathLookup::Missing {
                        dir: current,
                        missing: index,
                    };
                }
            }
        }
        PathLookup::Found(current)
    }

    /// Absolute virtual path of `id`.
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            segments.push(current.title.as_str());
            current = self.get(parent)?;
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    /// A title not yet used under `dir`, derived from `title` by appending
    /// ` (n)` before the extension.
    pub fn unique_title(&self, dir: NodeId, title: &str) -> String {
        self.unique_title_for(dir, title, None)
    }

    /// Like [`unique_title`](Self::unique_title), but a slot already held by
    /// `owner` counts as free.
    pub fn unique_title_for(&self, dir: NodeId, title: &str, owner: Option<NodeId>) -> String {
        let Ok(directory) = self.directory(dir) else {
            return title.to_string();
        };
        let free = |candidate: &str| match directory.children.get(candidate) {
            None => true,
            Some(id) => Some(*id) == owner,
        };
        if free(title) {
            return title.to_string();
        }
        let (stem, ext) = match title.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (title, None),
        };
        (2..)
            .map(|n| match ext {
                Some(ext) => format!("{} ({}).{}", stem, n, ext),
                None => format!("{} ({})", stem, n),
            })
            .find(|candidate| free(candidate))
            .unwrap_or_else(|| title.to_string())
    }

    /// Verify parent/child links and the resource-id index agree.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let links_ok = self.nodes.values().all(|node| match node.parent {
            None => node.id == self.root,
            Some(parent) => self
                .directory(parent)
                .ok()
                .and_then(|d| d.children.get(&node.title))
                == Some(&node.id),
        });
        let index_ok = self
            .by_resource_id
            .iter()
            .all(|(rid, id)| self.get(*id).is_some_and(|n| &n.resource_id == rid));
        let indexed = self
            .nodes
            .values()
            .filter(|n| !n.resource_id.is_empty())
            .count();
        links_ok && index_ok && indexed == self.by_resource_id.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fs::node::FileNode;

    pub(crate) fn dir(title: &str, rid: &str) -> NewNode {
        NewNode {
            title: title.to_string(),
            resource_id: rid.to_string(),
            edit_url: format!("edit/{}", rid),
            file_info: FileInfo::default(),
            kind: NodeKind::Directory(DirectoryNode::new(
                format!("feeds/{}", rid),
                format!("upload/{}", rid),
            )),
        }
    }

    pub(crate) fn file(title: &str, rid: &str) -> NewNode {
        NewNode {
            title: title.to_string(),
            resource_id: rid.to_string(),
            edit_url: format!("edit/{}", rid),
            file_info: FileInfo::default(),
            kind: NodeKind::File(FileNode {
                content_hash: format!("hash-{}", rid),
                content_url: format!("content/{}", rid),
                is_hosted_document: false,
            }),
        }
    }

    fn sample() -> (DirectoryTree, NodeId, NodeId) {
        let mut tree = DirectoryTree::new("feeds/root", "upload/root");
        let a = tree.add_child(tree.root(), dir("A", "f1")).unwrap();
        let b = tree.add_child(a, file("b.txt", "r1")).unwrap();
        (tree, a, b)
    }

    #[test]
    fn test_add_child_links_both_ways() {
        let (tree, a, b) = sample();
        assert_eq!(tree.get(b).unwrap().parent, Some(a));
        assert_eq!(tree.child(a, "b.txt"), Some(b));
        assert_eq!(tree.find_by_resource_id("r1"), Some(b));
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_add_child_rejects_duplicate_title() {
        let (mut tree, a, _) = sample();
        let err = tree.add_child(a, file("b.txt", "r2")).unwrap_err();
        assert_eq!(err, FsError::AlreadyExists("b.txt".to_string()));
        assert!(tree.find_by_resource_id("r2").is_none());
    }

    #[test]
    fn test_add_child_under_file_fails() {
        let (mut tree, _, b) = sample();
        let err = tree.add_child(b, file("x", "r9")).unwrap_err();
        assert!(matches!(err, FsError::NotADirectory(_)));
    }

    #[test]
    fn test_remove_child_drops_subtree_from_index() {
        let (mut tree, a, _) = sample();
        tree.add_child(a, dir("C", "f2")).unwrap();
        let c = tree.child(a, "C").unwrap();
        tree.add_child(c, file("d.txt", "r3")).unwrap();

        let removed = tree.remove_child(tree.root(), "A").unwrap();
        assert_eq!(removed.root().title, "A");
        assert_eq!(removed.nodes().len(), 4);
        let mut rids = removed.file_resource_ids();
        rids.sort();
        assert_eq!(rids, vec!["r1", "r3"]);

        assert!(tree.find_by_resource_id("r3").is_none());
        assert!(tree.is_empty());
        assert!(tree.is_consistent());

        let err = tree.remove_child(tree.root(), "A").unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[test]
    fn test_move_node_keeps_invariant() {
        let (mut tree, a, b) = sample();
        tree.move_node(b, tree.root(), "moved.txt").unwrap();

        assert_eq!(tree.get(b).unwrap().parent, Some(tree.root()));
        assert_eq!(tree.child(tree.root(), "moved.txt"), Some(b));
        assert!(tree.child(a, "b.txt").is_none());
        assert_eq!(tree.path_of(b).unwrap(), "/moved.txt");
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_move_into_own_subtree_fails() {
        let (mut tree, a, _) = sample();
        let c = tree.add_child(a, dir("C", "f2")).unwrap();
        let err = tree.move_node(a, c, "A").unwrap_err();
        assert!(matches!(err, FsError::InvalidOperation(_)));
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_find_by_path() {
        let (tree, a, b) = sample();
        assert_eq!(tree.find_by_path("/"), PathLookup::Found(tree.root()));
        assert_eq!(tree.find_by_path("/A/b.txt"), PathLookup::Found(b));
        assert_eq!(
            tree.find_by_path("/A/missing/x"),
            PathLookup::Missing { dir: a, missing: 1 }
        );
        assert_eq!(
            tree.find_by_path("/A/b.txt/x"),
            PathLookup::NotADirectory(b)
        );
    }

    #[test]
    fn test_unique_title() {
        let (mut tree, a, _) = sample();
        assert_eq!(tree.unique_title(a, "new.txt"), "new.txt");
        assert_eq!(tree.unique_title(a, "b.txt"), "b (2).txt");
        tree.add_child(a, file("b (2).txt", "r2")).unwrap();
        assert_eq!(tree.unique_title(a, "b.txt"), "b (3).txt");
        tree.add_child(a, dir("notes", "f5")).unwrap();
        assert_eq!(tree.unique_title(a, "notes"), "notes (2)");
    }

    #[test]
    fn test_empty_like_never_reuses_ids() {
        let (tree, _, b) = sample();
        let mut fresh = tree.empty_like();
        let id = fresh.add_child(fresh.root(), file("x", "r5")).unwrap();
        assert!(id > b);
        assert!(fresh.get(b).is_none());
    }
}
