//! On-disk cache layout.
//!
//! ```text
//! <root>/meta/         feed snapshots, uploads/ session state
//! <root>/pinned/       empty marker per pinned blob
//! <root>/outgoing/     blobs with local edits not yet committed
//! <root>/persistent/   pinned, clean blobs
//! <root>/tmp/          everything else; staging files; documents/ placeholders
//! ```
//!
//! A blob is named `<rid>.<hash>` with both parts escaped so the name is
//! filesystem safe and the first `.` is always the separator.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

pub(crate) const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSubdir {
    Meta,
    Pinned,
    Outgoing,
    Persistent,
    Tmp,
}

impl CacheSubdir {
    pub const ALL: [CacheSubdir; 5] = [
        CacheSubdir::Meta,
        CacheSubdir::Pinned,
        CacheSubdir::Outgoing,
        CacheSubdir::Persistent,
        CacheSubdir::Tmp,
    ];

    /// Subdirectories that hold blob content, highest priority first.
    pub const BLOB_DIRS: [CacheSubdir; 3] = [
        CacheSubdir::Outgoing,
        CacheSubdir::Persistent,
        CacheSubdir::Tmp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CacheSubdir::Meta => "meta",
            CacheSubdir::Pinned => "pinned",
            CacheSubdir::Outgoing => "outgoing",
            CacheSubdir::Persistent => "persistent",
            CacheSubdir::Tmp => "tmp",
        }
    }

    /// Where a blob with these flags belongs.
    pub fn for_flags(pinned: bool, dirty: bool) -> Self {
        match (pinned, dirty) {
            (_, true) => CacheSubdir::Outgoing,
            (true, false) => CacheSubdir::Persistent,
            (false, false) => CacheSubdir::Tmp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subdir(&self, subdir: CacheSubdir) -> PathBuf {
        self.root.join(subdir.name())
    }

    pub fn blob_path(&self, subdir: CacheSubdir, resource_id: &str, hash: &str) -> PathBuf {
        self.subdir(subdir).join(blob_file_name(resource_id, hash))
    }

    pub fn pin_marker(&self, resource_id: &str, hash: &str) -> PathBuf {
        self.blob_path(CacheSubdir::Pinned, resource_id, hash)
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.subdir(CacheSubdir::Tmp).join("documents")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.subdir(CacheSubdir::Meta).join("uploads")
    }

    pub fn root_feed_path(&self) -> PathBuf {
        self.subdir(CacheSubdir::Meta).join("root_feed.json")
    }

    /// Create every directory of the layout.
    pub fn create_dirs(&self) -> io::Result<()> {
        for subdir in CacheSubdir::ALL {
            std::fs::create_dir_all(self.subdir(subdir))?;
        }
        std::fs::create_dir_all(self.documents_dir())?;
        std::fs::create_dir_all(self.uploads_dir())?;
        Ok(())
    }

    /// A fresh staging file path under `tmp/`.
    pub fn staging_path(&self) -> PathBuf {
        let tag: u64 = rand::random();
        self.subdir(CacheSubdir::Tmp)
            .join(format!("staging-{:016x}{}", tag, PARTIAL_SUFFIX))
    }
}

/// Percent-escape everything outside `[A-Za-z0-9_-]`.
pub fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

pub fn unescape_component(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

pub fn blob_file_name(resource_id: &str, hash: &str) -> String {
    format!("{}.{}", escape_component(resource_id), escape_component(hash))
}

/// Recover `(resource_id, hash)` from a blob file name.
pub fn parse_blob_file_name(name: &str) -> Option<(String, String)> {
    let (rid, hash) = name.split_once('.')?;
    if rid.is_empty() || hash.is_empty() || hash.contains('.') {
        return None;
    }
    Some((unescape_component(rid)?, unescape_component(hash)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_names_are_filesystem_safe() {
        let name = blob_file_name("file:abc/../x", "d41d8cd9");
        assert!(!name.contains('/'));
        assert_eq!(name.matches('.').count(), 1);
        assert_eq!(
            parse_blob_file_name(&name),
            Some(("file:abc/../x".to_string(), "d41d8cd9".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_blob_file_name("noseparator"), None);
        assert_eq!(parse_blob_file_name("a.b.partial"), None);
        assert_eq!(parse_blob_file_name(".hidden"), None);
        assert_eq!(parse_blob_file_name("a.%G1"), None);
    }

    #[test]
    fn test_subdir_for_flags() {
        assert_eq!(CacheSubdir::for_flags(false, false), CacheSubdir::Tmp);
        assert_eq!(CacheSubdir::for_flags(true, false), CacheSubdir::Persistent);
        assert_eq!(CacheSubdir::for_flags(true, true), CacheSubdir::Outgoing);
        assert_eq!(CacheSubdir::for_flags(false, true), CacheSubdir::Outgoing);
    }

    #[test]
    fn test_create_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("GCache").join("v1"));
        layout.create_dirs().unwrap();
        for subdir in CacheSubdir::ALL {
            assert!(layout.subdir(subdir).is_dir());
        }
        assert!(layout.documents_dir().is_dir());
        assert!(layout.uploads_dir().is_dir());
    }
}
