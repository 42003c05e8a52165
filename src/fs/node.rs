//! Directory tree node types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable handle of a node inside one [`DirectoryTree`](super::DirectoryTree).
///
/// Ids are never reused within a tree, so a stale id simply stops resolving
/// once its node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

/// Where a directory's child list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentOrigin {
    /// Children reflect a completed remote refresh
    FromServer,
    /// Children were rebuilt from a local feed snapshot and may be stale
    FromCache,
    /// Children have never been loaded
    Initializing,
}

/// Size, timestamps and access flags of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
    /// Unix timestamp of the last remote modification
    pub last_modified: i64,
    /// Unix timestamp of creation
    pub created: i64,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    /// Digest of the current known content version
    pub content_hash: String,
    pub content_url: String,
    /// Remote-only document without a byte stream
    pub is_hosted_document: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    /// Children keyed by title
    pub children: BTreeMap<String, NodeId>,
    /// Locator of this directory's own feed
    pub content_url: String,
    /// Locator new uploads into this directory are sent to
    pub upload_url: String,
    pub origin: ContentOrigin,
}

impl DirectoryNode {
    pub fn new(content_url: impl Into<String>, upload_url: impl Into<String>) -> Self {
        Self {
            children: BTreeMap::new(),
            content_url: content_url.into(),
            upload_url: upload_url.into(),
            origin: ContentOrigin::Initializing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File(FileNode),
    Directory(DirectoryNode),
}

/// A file or directory in the virtual tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub title: String,
    /// Owning directory; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Remote identifier; empty for the synthetic root.
    pub resource_id: String,
    pub edit_url: String,
    pub file_info: FileInfo,
    pub kind: NodeKind,
}

impl Node {
    /// Check if this node is a file.
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File(_))
    }

    /// Check if this node is a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match &self.kind {
            NodeKind::File(file) => Some(file),
            NodeKind::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryNode> {
        match &self.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(_) => None,
        }
    }

    pub(crate) fn as_directory_mut(&mut self) -> Option<&mut DirectoryNode> {
        match &mut self.kind {
            NodeKind::Directory(dir) => Some(dir),
            NodeKind::File(_) => None,
        }
    }

    /// Check if this is a hosted document (placeholder instead of bytes).
    pub fn is_hosted_document(&self) -> bool {
        self.as_file().is_some_and(|f| f.is_hosted_document)
    }

    /// Locator a directory lists its children from; a file's download locator.
    pub fn content_url(&self) -> &str {
        match &self.kind {
            NodeKind::File(file) => &file.content_url,
            NodeKind::Directory(dir) => &dir.content_url,
        }
    }
}

/// Remote properties of a file, as returned by a path lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProperties {
    pub file_info: FileInfo,
    pub resource_id: String,
    pub file_md5: String,
    pub content_url: String,
    pub edit_url: String,
    pub is_hosted_document: bool,
}

/// Storage quota information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Total storage in bytes
    pub total: u64,
    /// Used storage in bytes
    pub used: u64,
}

impl Quota {
    /// Get free storage in bytes.
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Get usage percentage.
    pub fn usage_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.used as f64 / self.total as f64) * 100.0
        }
    }
}
