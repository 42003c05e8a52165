//! Feed parsing and merging.
//!
//! A feed page is a JSON document of the form
//!
//! ```json
//! { "entries": [ { "kind": "folder", "resource_id": "...", "title": "...",
//!                  "parent": "...", "md5": "...", "content_url": "...",
//!                  "edit_url": "...", "upload_url": "...", "size": 0,
//!                  "updated": 0, "created": 0, "read_only": false } ],
//!   "next": "continuation locator" }
//! ```
//!
//! Pages are parsed and validated first. Only a fully valid set of entries
//! is ever applied to a [`DirectoryTree`], so malformed input never leaves a
//! half-merged tree behind.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::node::{ContentOrigin, DirectoryNode, FileInfo, FileNode, NodeId, NodeKind};
use super::tree::{DirectoryTree, NewNode};
use crate::error::{FsError, Result};

/// Entry category as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Folder,
    File,
    Document,
    Spreadsheet,
    Presentation,
    Drawing,
    /// Any other downloadable type (pdf, image, ...)
    #[serde(other)]
    Other,
}

impl EntryKind {
    pub fn is_folder(&self) -> bool {
        *self == EntryKind::Folder
    }

    /// Web-native documents without a byte stream.
    pub fn is_hosted_document(&self) -> bool {
        matches!(
            self,
            EntryKind::Document
                | EntryKind::Spreadsheet
                | EntryKind::Presentation
                | EntryKind::Drawing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub kind: EntryKind,
    pub resource_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default)]
    pub content_url: String,
    #[serde(default)]
    pub edit_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub updated: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub read_only: bool,
}

impl FeedEntry {
    fn validate(&mut self) -> Result<()> {
        if self.resource_id.is_empty() {
            return Err(FsError::ParseError("entry without resource_id".to_string()));
        }
        if self.title.is_empty() {
            return Err(FsError::ParseError(format!(
                "entry {} has an empty title",
                self.resource_id
            )));
        }
        if self.content_url.is_empty() && !self.kind.is_hosted_document() {
            return Err(FsError::ParseError(format!(
                "entry {} has no content_url",
                self.resource_id
            )));
        }
        if !self.kind.is_folder() && !self.kind.is_hosted_document() && self.md5.is_none() {
            return Err(FsError::ParseError(format!(
                "file {} has no content hash",
                self.resource_id
            )));
        }
        // Titles are path segments locally.
        if self.title.contains('/') {
            self.title = self.title.replace('/', "_");
        }
        Ok(())
    }

    pub(crate) fn to_new_node(&self, origin: ContentOrigin) -> NewNode {
        let kind = if self.kind.is_folder() {
            let mut dir = DirectoryNode::new(
                self.content_url.clone(),
                self.upload_url.clone().unwrap_or_default(),
            );
            dir.origin = origin;
            NodeKind::Directory(dir)
        } else {
            NodeKind::File(FileNode {
                content_hash: self.md5.clone().unwrap_or_default(),
                content_url: self.content_url.clone(),
                is_hosted_document: self.kind.is_hosted_document(),
            })
        };
        NewNode {
            title: self.title.clone(),
            resource_id: self.resource_id.clone(),
            edit_url: self.edit_url.clone(),
            file_info: FileInfo {
                size: self.size,
                last_modified: self.updated,
                created: self.created,
                read_only: self.read_only,
            },
            kind,
        }
    }
}

/// One validated page of a feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub entries: Vec<FeedEntry>,
    /// Locator of the next page, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Parse and validate one feed page. Never touches a tree.
pub fn parse_feed_page(value: &Value) -> Result<FeedPage> {
    let mut page = FeedPage::deserialize(value)
        .map_err(|e| FsError::ParseError(format!("malformed feed page: {}", e)))?;
    for entry in &mut page.entries {
        entry.validate()?;
    }
    Ok(page)
}

/// Parse the single entry a mutating call answers with.
pub fn parse_entry(value: &Value) -> Result<FeedEntry> {
    let mut entry = FeedEntry::deserialize(value)
        .map_err(|e| FsError::ValidationError(format!("malformed entry: {}", e)))?;
    entry
        .validate()
        .map_err(|e| FsError::ValidationError(e.to_string()))?;
    Ok(entry)
}

/// Counts reported after merging a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFeed {
    pub target: NodeId,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl AppliedFeed {
    fn new(target: NodeId) -> Self {
        Self {
            target,
            added: 0,
            updated: 0,
            removed: 0,
            skipped: 0,
        }
    }
}

/// Build a fresh tree from a complete root feed.
///
/// Entries without a parent go to the root. Entries are placed parents
/// first, in as many passes as needed; entries whose parent never appears
/// are skipped. Duplicate titles within one directory get a ` (n)` suffix.
pub fn build_root_tree(
    previous: &DirectoryTree,
    entries: &[FeedEntry],
    origin: ContentOrigin,
) -> (DirectoryTree, AppliedFeed) {
    let mut tree = previous.empty_like();
    let root = tree.root();
    let mut stats = AppliedFeed::new(root);

    let mut seen = HashSet::new();
    let mut pending: Vec<&FeedEntry> = entries
        .iter()
        .filter(|e| seen.insert(e.resource_id.as_str()))
        .collect();

    loop {
        let before = pending.len();
        pending.retain(|entry| {
            let parent = match &entry.parent {
                None => root,
                Some(rid) => match tree.find_by_resource_id(rid) {
                    Some(id) => id,
                    None => return true,
                },
            };
            place(&mut tree, parent, entry, origin, &mut stats);
            false
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }

    for entry in pending {
        warn!(
            resource_id = %entry.resource_id,
            parent = ?entry.parent,
            "feed entry references an unknown parent, skipping"
        );
        stats.skipped += 1;
    }

    let _ = tree.set_origin(root, origin);
    debug!(
        added = stats.added,
        skipped = stats.skipped,
        "built directory tree from root feed"
    );
    (tree, stats)
}

fn place(
    tree: &mut DirectoryTree,
    parent: NodeId,
    entry: &FeedEntry,
    origin: ContentOrigin,
    stats: &mut AppliedFeed,
) {
    let mut node = entry.to_new_node(origin);
    node.title = tree.unique_title(parent, &entry.title);
    match tree.add_child(parent, node) {
        Ok(_) => stats.added += 1,
        Err(err) => {
            warn!(resource_id = %entry.resource_id, error = %err, "cannot place feed entry");
            stats.skipped += 1;
        }
    }
}

/// Merge the complete listing of directory `target` into `tree`.
///
/// Known resource ids are updated (and moved here if they lived elsewhere),
/// new ones are added, and children of `target` missing from the listing are
/// dropped. New subdirectories start out unloaded.
pub fn merge_directory_listing(
    tree: &mut DirectoryTree,
    target: NodeId,
    entries: &[FeedEntry],
    origin: ContentOrigin,
) -> Result<AppliedFeed> {
    let Some(node) = tree.get(target) else {
        return Err(FsError::NotFound(format!("node {:?}", target)));
    };
    if !node.is_directory() {
        return Err(FsError::NotADirectory(node.title.clone()));
    }

    let mut stats = AppliedFeed::new(target);
    let listed: HashSet<&str> = entries.iter().map(|e| e.resource_id.as_str()).collect();

    let stale: Vec<String> = tree
        .children(target)
        .into_iter()
        .filter(|child| !listed.contains(child.resource_id.as_str()))
        .map(|child| child.title.clone())
        .collect();
    for title in stale {
        if tree.remove_child(target, &title).is_ok() {
            stats.removed += 1;
        }
    }

    for entry in entries {
        match tree.find_by_resource_id(&entry.resource_id) {
            Some(id) if tree.is_ancestor(id, target) => {
                warn!(resource_id = %entry.resource_id, "feed lists an ancestor as a child, skipping");
                stats.skipped += 1;
            }
            Some(id) => {
                update_existing(tree, id, target, entry, &mut stats);
            }
            None => place(tree, target, entry, ContentOrigin::Initializing, &mut stats),
        }
    }

    tree.set_origin(target, origin)?;
    debug!(
        added = stats.added,
        updated = stats.updated,
        removed = stats.removed,
        "merged directory listing"
    );
    Ok(stats)
}

fn update_existing(
    tree: &mut DirectoryTree,
    id: NodeId,
    target: NodeId,
    entry: &FeedEntry,
    stats: &mut AppliedFeed,
) {
    let Some(existing) = tree.get(id) else {
        return;
    };
    if existing.is_directory() != entry.kind.is_folder() {
        // Kind changed remotely; replace the node outright.
        if tree.remove(id).is_ok() {
            stats.removed += 1;
        }
        place(tree, target, entry, ContentOrigin::Initializing, stats);
        return;
    }

    // A suffixed duplicate keeps its slot as long as the plain title is taken.
    let title = tree.unique_title_for(target, &entry.title, Some(id));
    let needs_move = existing.parent != Some(target) || existing.title != title;
    if needs_move {
        if let Err(err) = tree.move_node(id, target, &title) {
            warn!(resource_id = %entry.resource_id, error = %err, "cannot relocate feed entry");
            stats.skipped += 1;
            return;
        }
    }

    let fresh = entry.to_new_node(ContentOrigin::Initializing);
    if let Some(node) = tree.get_mut(id) {
        node.edit_url = fresh.edit_url;
        node.file_info = fresh.file_info;
        match (&mut node.kind, fresh.kind) {
            (NodeKind::File(file), NodeKind::File(new_file)) => *file = new_file,
            (NodeKind::Directory(dir), NodeKind::Directory(new_dir)) => {
                dir.content_url = new_dir.content_url;
                dir.upload_url = new_dir.upload_url;
            }
            _ => {}
        }
    }
    stats.updated += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tree::PathLookup;
    use serde_json::json;

    fn folder(rid: &str, title: &str, parent: Option<&str>) -> Value {
        let mut v = json!({
            "kind": "folder",
            "resource_id": rid,
            "title": title,
            "content_url": format!("feeds/{}", rid),
            "upload_url": format!("upload/{}", rid),
            "edit_url": format!("edit/{}", rid),
        });
        if let Some(p) = parent {
            v["parent"] = json!(p);
        }
        v
    }

    fn file(rid: &str, title: &str, parent: Option<&str>) -> Value {
        let mut v = json!({
            "kind": "file",
            "resource_id": rid,
            "title": title,
            "md5": format!("md5-{}", rid),
            "content_url": format!("content/{}", rid),
            "edit_url": format!("edit/{}", rid),
            "size": 3,
        });
        if let Some(p) = parent {
            v["parent"] = json!(p);
        }
        v
    }

    fn entries(values: Vec<Value>) -> Vec<FeedEntry> {
        parse_feed_page(&json!({ "entries": values })).unwrap().entries
    }

    #[test]
    fn test_parse_classifies_kinds() {
        let page = parse_feed_page(&json!({
            "entries": [
                folder("f1", "A", None),
                file("r1", "b.txt", Some("f1")),
                {"kind": "document", "resource_id": "d1", "title": "Doc1",
                 "content_url": "export/d1", "edit_url": "edit/d1"},
                {"kind": "pdf", "resource_id": "p1", "title": "x.pdf", "md5": "m",
                 "content_url": "content/p1"},
            ],
            "next": "page2"
        }))
        .unwrap();

        assert_eq!(page.next.as_deref(), Some("page2"));
        assert!(page.entries[0].kind.is_folder());
        assert_eq!(page.entries[1].kind, EntryKind::File);
        assert!(page.entries[2].kind.is_hosted_document());
        assert_eq!(page.entries[3].kind, EntryKind::Other);
    }

    #[test]
    fn test_parse_rejects_malformed_pages() {
        assert!(matches!(
            parse_feed_page(&json!({"entries": "nope"})),
            Err(FsError::ParseError(_))
        ));
        assert!(matches!(
            parse_feed_page(&json!({"entries": [{"kind": "file", "resource_id": "r", "title": "t", "content_url": "c"}]})),
            Err(FsError::ParseError(_))
        ));
        assert!(matches!(
            parse_feed_page(&json!({"entries": [{"kind": "folder", "resource_id": "", "title": "t", "content_url": "c"}]})),
            Err(FsError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_entry_reports_validation_errors() {
        let entry = parse_entry(&folder("f1", "A/B", None)).unwrap();
        assert_eq!(entry.title, "A_B");

        assert!(matches!(
            parse_entry(&json!({"kind": "file"})),
            Err(FsError::ValidationError(_))
        ));
    }

    #[test]
    fn test_build_defers_children_listed_before_parents() {
        let previous = DirectoryTree::new("feeds/root", "upload/root");
        let listed = entries(vec![
            file("r1", "b.txt", Some("f2")),
            folder("f2", "B", Some("f1")),
            folder("f1", "A", None),
            file("r9", "orphan.txt", Some("nowhere")),
        ]);

        let (tree, stats) = build_root_tree(&previous, &listed, ContentOrigin::FromServer);

        assert_eq!(stats.added, 3);
        assert_eq!(stats.skipped, 1);
        let PathLookup::Found(id) = tree.find_by_path("/A/B/b.txt") else {
            panic!("file should resolve");
        };
        assert_eq!(tree.get(id).unwrap().resource_id, "r1");
        assert_eq!(tree.origin(tree.root()), Some(ContentOrigin::FromServer));
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_build_suffixes_duplicate_titles() {
        let previous = DirectoryTree::new("feeds/root", "upload/root");
        let listed = entries(vec![
            file("r1", "notes.txt", None),
            file("r2", "notes.txt", None),
        ]);

        let (tree, _) = build_root_tree(&previous, &listed, ContentOrigin::FromServer);

        assert!(tree.child(tree.root(), "notes.txt").is_some());
        let second = tree.child(tree.root(), "notes (2).txt").unwrap();
        assert_eq!(tree.get(second).unwrap().resource_id, "r2");
    }

    #[test]
    fn test_merge_directory_listing() {
        let previous = DirectoryTree::new("feeds/root", "upload/root");
        let (mut tree, _) = build_root_tree(
            &previous,
            &entries(vec![
                folder("f1", "A", None),
                file("r1", "old.txt", Some("f1")),
                file("r2", "gone.txt", Some("f1")),
                file("r3", "elsewhere.txt", None),
            ]),
            ContentOrigin::FromCache,
        );
        let a = tree.find_by_resource_id("f1").unwrap();

        let stats = merge_directory_listing(
            &mut tree,
            a,
            &entries(vec![
                file("r1", "renamed.txt", Some("f1")),
                file("r3", "elsewhere.txt", Some("f1")),
                folder("f2", "Sub", Some("f1")),
            ]),
            ContentOrigin::FromServer,
        )
        .unwrap();

        assert_eq!(stats.removed, 1);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.added, 1);
        assert!(tree.find_by_resource_id("r2").is_none());
        assert_eq!(tree.path_of(tree.find_by_resource_id("r1").unwrap()).unwrap(), "/A/renamed.txt");
        assert_eq!(tree.path_of(tree.find_by_resource_id("r3").unwrap()).unwrap(), "/A/elsewhere.txt");
        let sub = tree.find_by_resource_id("f2").unwrap();
        assert_eq!(tree.origin(sub), Some(ContentOrigin::Initializing));
        assert_eq!(tree.origin(a), Some(ContentOrigin::FromServer));
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_merge_keeps_duplicate_titles_stable() {
        let previous = DirectoryTree::new("feeds/root", "upload/root");
        let (mut tree, _) = build_root_tree(
            &previous,
            &entries(vec![
                folder("f1", "A", None),
                file("r1", "notes.txt", Some("f1")),
                file("r2", "notes.txt", Some("f1")),
            ]),
            ContentOrigin::FromCache,
        );
        let a = tree.find_by_resource_id("f1").unwrap();
        let listing = entries(vec![
            file("r1", "notes.txt", Some("f1")),
            file("r2", "notes.txt", Some("f1")),
        ]);

        for _ in 0..3 {
            merge_directory_listing(&mut tree, a, &listing, ContentOrigin::FromServer).unwrap();
            assert_eq!(tree.path_of(tree.find_by_resource_id("r1").unwrap()).unwrap(), "/A/notes.txt");
            assert_eq!(
                tree.path_of(tree.find_by_resource_id("r2").unwrap()).unwrap(),
                "/A/notes (2).txt"
            );
        }

        // Once the plain title frees up, the duplicate takes it.
        merge_directory_listing(
            &mut tree,
            a,
            &entries(vec![file("r2", "notes.txt", Some("f1"))]),
            ContentOrigin::FromServer,
        )
        .unwrap();
        assert_eq!(tree.path_of(tree.find_by_resource_id("r2").unwrap()).unwrap(), "/A/notes.txt");
        assert!(tree.is_consistent());
    }

    #[test]
    fn test_merge_into_file_fails_without_mutation() {
        let previous = DirectoryTree::new("feeds/root", "upload/root");
        let (mut tree, _) = build_root_tree(
            &previous,
            &entries(vec![file("r1", "a.txt", None)]),
            ContentOrigin::FromServer,
        );
        let a = tree.find_by_resource_id("r1").unwrap();
        let before = tree.len();

        let err = merge_directory_listing(&mut tree, a, &[], ContentOrigin::FromServer).unwrap_err();
        assert!(matches!(err, FsError::NotADirectory(_)));
        assert_eq!(tree.len(), before);
    }
}
