//! Directory tree model, feed parsing and upload bookkeeping.

pub mod feed;
pub(crate) mod node;
pub mod tree;
pub mod upload_state;
pub(crate) mod utils;

pub use feed::{EntryKind, FeedEntry, FeedPage, parse_entry, parse_feed_page};
pub use node::{
    ContentOrigin, DirectoryNode, FileInfo, FileNode, FileProperties, Node, NodeId, NodeKind,
    Quota,
};
pub use tree::{DirectoryTree, NewNode, PathLookup, RemovedSubtree};
pub use upload_state::UploadState;
