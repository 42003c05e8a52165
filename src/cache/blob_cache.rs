//! Content-addressed blob cache.
//!
//! Blobs are keyed by `(resource_id, content_hash)`. Flags are encoded by
//! location: dirty blobs live in `outgoing/`, pinned clean blobs in
//! `persistent/`, all others in `tmp/`, and a pinned blob additionally has a
//! marker in `pinned/`. The in-memory index is rebuilt from that layout on
//! first use, so the disk is always the source of truth.
//!
//! Mutations are serialized by an async gate and do their disk work on the
//! blocking pool. The index mutex is only held for map updates.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info, warn};

use super::layout::{CacheLayout, CacheSubdir, PARTIAL_SUFFIX, parse_blob_file_name};
use super::run_blocking;
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::observer::{FileSystemObserver, ObserverList};

/// Where stored content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedFileOrigin {
    /// Downloaded; identical to the remote version
    FromServer,
    /// Local edit not yet committed remotely; stored dirty
    LocallyModified,
}

/// How `store` takes the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Rename the source into the cache (copying across devices)
    Move,
    /// Leave the source in place
    Copy,
}

/// Flags of one cached blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheState {
    pub present: bool,
    pub pinned: bool,
    pub dirty: bool,
}

#[derive(Debug, Clone)]
struct BlobEntry {
    subdir: CacheSubdir,
    pinned: bool,
    dirty: bool,
    size: u64,
    last_access: u64,
}

impl BlobEntry {
    fn is_evictable(&self) -> bool {
        !self.pinned && !self.dirty
    }
}

#[derive(Debug, Default)]
struct ResourceEntry {
    current: Option<String>,
    blobs: HashMap<String, BlobEntry>,
}

#[derive(Debug, Default)]
struct CacheIndex {
    resources: HashMap<String, ResourceEntry>,
    tick: u64,
}

struct Victim {
    resource_id: String,
    hash: String,
    subdir: CacheSubdir,
    size: u64,
}

impl CacheIndex {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&self, resource_id: &str, hash: &str) -> Option<&BlobEntry> {
        self.resources.get(resource_id)?.blobs.get(hash)
    }

    fn get_mut(&mut self, resource_id: &str, hash: &str) -> Option<&mut BlobEntry> {
        self.resources.get_mut(resource_id)?.blobs.get_mut(hash)
    }

    fn current(&self, resource_id: &str) -> Option<(String, BlobEntry)> {
        let resource = self.resources.get(resource_id)?;
        let hash = resource.current.as_ref()?;
        Some((hash.clone(), resource.blobs.get(hash)?.clone()))
    }

    fn remove_blob(&mut self, resource_id: &str, hash: &str) -> Option<BlobEntry> {
        let resource = self.resources.get_mut(resource_id)?;
        let removed = resource.blobs.remove(hash);
        if resource.current.as_deref() == Some(hash) {
            resource.current = None;
        }
        if resource.blobs.is_empty() {
            self.resources.remove(resource_id);
        }
        removed
    }

    fn total_bytes_excluding(&self, exclude: (&str, &str)) -> u64 {
        self.resources
            .iter()
            .flat_map(|(rid, r)| r.blobs.iter().map(move |(hash, e)| (rid, hash, e)))
            .filter(|(rid, hash, _)| (rid.as_str(), hash.as_str()) != exclude)
            .map(|(_, _, e)| e.size)
            .sum()
    }

    /// Evictable blobs, least recently used first.
    fn eviction_candidates(&self, exclude: (&str, &str)) -> Vec<Victim> {
        let mut candidates: Vec<(u64, Victim)> = self
            .resources
            .iter()
            .flat_map(|(rid, r)| r.blobs.iter().map(move |(hash, e)| (rid, hash, e)))
            .filter(|(rid, hash, e)| e.is_evictable() && (rid.as_str(), hash.as_str()) != exclude)
            .map(|(rid, hash, e)| {
                (
                    e.last_access,
                    Victim {
                        resource_id: rid.clone(),
                        hash: hash.clone(),
                        subdir: e.subdir,
                        size: e.size,
                    },
                )
            })
            .collect();
        candidates.sort_by_key(|(access, _)| *access);
        candidates.into_iter().map(|(_, v)| v).collect()
    }
}

struct CacheInner {
    layout: CacheLayout,
    max_bytes: Option<u64>,
    min_free_disk: u64,
    index: Mutex<CacheIndex>,
    init: OnceCell<()>,
    gate: AsyncMutex<()>,
    observers: Arc<ObserverList<dyn FileSystemObserver>>,
}

/// Disk-backed cache of remote file content.
///
/// Cheap to clone; clones share the same index. Every entry point
/// initializes the cache on first use.
#[derive(Clone)]
pub struct BlobCache {
    inner: Arc<CacheInner>,
}

impl BlobCache {
    pub fn new(config: &FsConfig) -> Self {
        Self::with_observers(config, Arc::new(ObserverList::default()))
    }

    pub(crate) fn with_observers(
        config: &FsConfig,
        observers: Arc<ObserverList<dyn FileSystemObserver>>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                layout: CacheLayout::new(config.cache_root.clone()),
                max_bytes: config.max_cache_bytes,
                min_free_disk: config.min_free_disk_bytes,
                index: Mutex::new(CacheIndex::default()),
                init: OnceCell::new(),
                gate: AsyncMutex::new(()),
                observers,
            }),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    /// Directory for scratch files that may be discarded at any time.
    pub fn tmp_dir(&self) -> PathBuf {
        self.inner.layout.subdir(CacheSubdir::Tmp)
    }

    pub fn add_observer(&self, observer: Arc<dyn FileSystemObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn FileSystemObserver>) {
        self.inner.observers.remove(observer);
    }

    /// Scan the on-disk layout once. Concurrent callers share one scan; a
    /// failed scan is retried by the next caller.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .init
            .get_or_try_init(|| async {
                let layout = self.inner.layout.clone();
                let (index, healed) = run_blocking(move || Ok(scan(&layout)?)).await?;
                let blobs: usize = index.resources.values().map(|r| r.blobs.len()).sum();
                let bytes = index.total_bytes_excluding(("", ""));
                *self.inner.index.lock() = index;
                info!(
                    root = %self.inner.layout.root().display(),
                    blobs,
                    bytes,
                    healed,
                    "blob cache initialized"
                );
                Ok::<(), FsError>(())
            })
            .await?;
        Ok(())
    }

    /// Store `source` as the current content of `resource_id`.
    ///
    /// The blob is written under a staging name and renamed into place, so
    /// readers see either the previous blob or the new one. If the
    /// resource's current version was pinned, the new version inherits the
    /// pin. May evict to make room.
    pub async fn store(
        &self,
        resource_id: &str,
        hash: &str,
        source: &Path,
        origin: CachedFileOrigin,
        mode: StoreMode,
    ) -> Result<PathBuf> {
        self.initialize().await?;

        let staging = self.inner.layout.staging_path();
        let size = {
            let source = source.to_path_buf();
            let staging = staging.clone();
            run_blocking(move || stage_blob(&source, &staging, mode)).await?
        };

        let _gate = self.inner.gate.lock().await;
        let result = self
            .commit_staged(resource_id, hash, &staging, size, origin)
            .await;
        if result.is_err() {
            let _ = run_blocking(move || {
                let _ = std::fs::remove_file(&staging);
                Ok(())
            })
            .await;
        }
        result
    }

    async fn commit_staged(
        &self,
        resource_id: &str,
        hash: &str,
        staging: &Path,
        size: u64,
        origin: CachedFileOrigin,
    ) -> Result<PathBuf> {
        let (existing, superseded) = {
            let index = self.inner.index.lock();
            let existing = index.get(resource_id, hash).cloned();
            let superseded = index
                .current(resource_id)
                .filter(|(current, entry)| current != hash && entry.pinned);
            (existing, superseded)
        };
        let was_pinned = existing.as_ref().is_some_and(|e| e.pinned);
        let pinned = was_pinned || superseded.is_some();
        let dirty = origin == CachedFileOrigin::LocallyModified;
        let target = CacheSubdir::for_flags(pinned, dirty);

        self.ensure_space(size, (resource_id, hash)).await?;

        let layout = self.inner.layout.clone();
        let final_path = layout.blob_path(target, resource_id, hash);
        {
            let rid = resource_id.to_string();
            let hash = hash.to_string();
            let staging = staging.to_path_buf();
            let final_path = final_path.clone();
            let old_subdir = existing.as_ref().map(|e| e.subdir);
            let superseded = superseded.clone();
            run_blocking(move || {
                std::fs::rename(&staging, &final_path)?;
                if let Some(old) = old_subdir.filter(|old| *old != target) {
                    remove_if_exists(&layout.blob_path(old, &rid, &hash))?;
                }
                if pinned {
                    std::fs::File::create(layout.pin_marker(&rid, &hash))?;
                }
                if let Some((old_hash, old_entry)) = &superseded {
                    remove_if_exists(&layout.pin_marker(&rid, old_hash))?;
                    let to = CacheSubdir::for_flags(false, old_entry.dirty);
                    if to != old_entry.subdir {
                        std::fs::rename(
                            layout.blob_path(old_entry.subdir, &rid, old_hash),
                            layout.blob_path(to, &rid, old_hash),
                        )?;
                    }
                }
                Ok(())
            })
            .await?;
        }

        {
            let mut index = self.inner.index.lock();
            let tick = index.touch();
            if let Some((old_hash, old_entry)) = &superseded {
                if let Some(entry) = index.get_mut(resource_id, old_hash) {
                    entry.pinned = false;
                    entry.subdir = CacheSubdir::for_flags(false, old_entry.dirty);
                }
            }
            let resource = index.resources.entry(resource_id.to_string()).or_default();
            resource.current = Some(hash.to_string());
            resource.blobs.insert(
                hash.to_string(),
                BlobEntry {
                    subdir: target,
                    pinned,
                    dirty,
                    size,
                    last_access: tick,
                },
            );
        }

        debug!(resource_id, hash, size, subdir = target.name(), "stored blob");
        if let Some((old_hash, _)) = &superseded {
            self.inner
                .observers
                .notify(|o| o.on_file_unpinned(resource_id, old_hash));
        }
        if pinned && !was_pinned {
            self.inner
                .observers
                .notify(|o| o.on_file_pinned(resource_id, hash));
        }
        Ok(final_path)
    }

    /// Path of the blob for `(resource_id, hash)`.
    pub async fn retrieve(&self, resource_id: &str, hash: &str) -> Result<PathBuf> {
        self.initialize().await?;
        let path = {
            let mut index = self.inner.index.lock();
            let tick = index.touch();
            let entry = index
                .get_mut(resource_id, hash)
                .ok_or_else(|| FsError::NotFound(format!("{}:{}", resource_id, hash)))?;
            entry.last_access = tick;
            self.inner.layout.blob_path(entry.subdir, resource_id, hash)
        };

        let probe = path.clone();
        let present = run_blocking(move || Ok(probe.is_file())).await?;
        if !present {
            warn!(resource_id, hash, "cached blob vanished from disk, dropping entry");
            self.inner.index.lock().remove_blob(resource_id, hash);
            return Err(FsError::NotFound(format!("{}:{}", resource_id, hash)));
        }
        Ok(path)
    }

    /// Index-only lookup that never waits or touches the disk.
    ///
    /// Returns `None` until the cache has been initialized.
    pub fn peek(&self, resource_id: &str, hash: &str) -> Option<PathBuf> {
        if !self.inner.init.initialized() {
            return None;
        }
        let index = self.inner.index.lock();
        let entry = index.get(resource_id, hash)?;
        Some(self.inner.layout.blob_path(entry.subdir, resource_id, hash))
    }

    /// Delete every blob stored for `resource_id`. Removing an unknown id
    /// succeeds.
    pub async fn remove(&self, resource_id: &str) -> Result<()> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;
        let Some(resource) = self.inner.index.lock().resources.remove(resource_id) else {
            return Ok(());
        };

        let layout = self.inner.layout.clone();
        let rid = resource_id.to_string();
        let count = resource.blobs.len();
        run_blocking(move || {
            for (hash, entry) in &resource.blobs {
                remove_if_exists(&layout.blob_path(entry.subdir, &rid, hash))?;
                if entry.pinned {
                    remove_if_exists(&layout.pin_marker(&rid, hash))?;
                }
            }
            Ok(())
        })
        .await?;
        debug!(resource_id, blobs = count, "removed cached blobs");
        Ok(())
    }

    /// Delete one clean, unpinned version. Returns whether it was removed;
    /// pinned or dirty versions are kept.
    pub async fn discard(&self, resource_id: &str, hash: &str) -> Result<bool> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;
        let removed = {
            let mut index = self.inner.index.lock();
            match index.get(resource_id, hash) {
                Some(entry) if !entry.pinned && !entry.dirty => index.remove_blob(resource_id, hash),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            return Ok(false);
        };

        let path = self.inner.layout.blob_path(entry.subdir, resource_id, hash);
        run_blocking(move || Ok(remove_if_exists(&path)?)).await?;
        debug!(resource_id, hash, "discarded cached blob");
        Ok(true)
    }

    /// Exempt a blob from eviction.
    pub async fn pin(&self, resource_id: &str, hash: &str) -> Result<()> {
        if self.set_pinned(resource_id, hash, true).await? {
            self.inner
                .observers
                .notify(|o| o.on_file_pinned(resource_id, hash));
        }
        Ok(())
    }

    pub async fn unpin(&self, resource_id: &str, hash: &str) -> Result<()> {
        if self.set_pinned(resource_id, hash, false).await? {
            self.inner
                .observers
                .notify(|o| o.on_file_unpinned(resource_id, hash));
        }
        Ok(())
    }

    /// Returns whether the flag changed.
    async fn set_pinned(&self, resource_id: &str, hash: &str, pinned: bool) -> Result<bool> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;
        let entry = self
            .inner
            .index
            .lock()
            .get(resource_id, hash)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("{}:{}", resource_id, hash)))?;
        if entry.pinned == pinned {
            return Ok(false);
        }

        let target = CacheSubdir::for_flags(pinned, entry.dirty);
        let layout = self.inner.layout.clone();
        let rid = resource_id.to_string();
        let h = hash.to_string();
        run_blocking(move || {
            if pinned {
                std::fs::File::create(layout.pin_marker(&rid, &h))?;
            } else {
                remove_if_exists(&layout.pin_marker(&rid, &h))?;
            }
            if target != entry.subdir {
                std::fs::rename(
                    layout.blob_path(entry.subdir, &rid, &h),
                    layout.blob_path(target, &rid, &h),
                )?;
            }
            Ok(())
        })
        .await?;

        if let Some(entry) = self.inner.index.lock().get_mut(resource_id, hash) {
            entry.pinned = pinned;
            entry.subdir = target;
        }
        debug!(resource_id, hash, pinned, "changed pin state");
        Ok(true)
    }

    /// Clear the dirty flag once local edits have been uploaded.
    pub async fn commit(&self, resource_id: &str, hash: &str) -> Result<()> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;
        let entry = self
            .inner
            .index
            .lock()
            .get(resource_id, hash)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("{}:{}", resource_id, hash)))?;
        if !entry.dirty {
            return Ok(());
        }

        let target = CacheSubdir::for_flags(entry.pinned, false);
        let layout = self.inner.layout.clone();
        let rid = resource_id.to_string();
        let h = hash.to_string();
        run_blocking(move || {
            std::fs::rename(
                layout.blob_path(entry.subdir, &rid, &h),
                layout.blob_path(target, &rid, &h),
            )?;
            Ok(())
        })
        .await?;

        if let Some(entry) = self.inner.index.lock().get_mut(resource_id, hash) {
            entry.dirty = false;
            entry.subdir = target;
        }
        debug!(resource_id, hash, "committed dirty blob");
        Ok(())
    }

    /// Flags of `(resource_id, hash)`, or `None` if it is not cached.
    pub async fn state(&self, resource_id: &str, hash: &str) -> Result<Option<CacheState>> {
        self.initialize().await?;
        let index = self.inner.index.lock();
        Ok(index.get(resource_id, hash).map(|e| CacheState {
            present: true,
            pinned: e.pinned,
            dirty: e.dirty,
        }))
    }

    /// Bytes held by all cached blobs.
    pub async fn total_bytes(&self) -> Result<u64> {
        self.initialize().await?;
        Ok(self.inner.index.lock().total_bytes_excluding(("", "")))
    }

    /// Evict unprotected blobs until at least `bytes` are freed.
    pub async fn free_space(&self, bytes: u64) -> Result<u64> {
        self.initialize().await?;
        let _gate = self.inner.gate.lock().await;
        self.evict(bytes, ("", "")).await
    }

    /// Make room for `incoming` more bytes. Caller holds the gate.
    async fn ensure_space(&self, incoming: u64, exclude: (&str, &str)) -> Result<()> {
        let quota_deficit = match self.inner.max_bytes {
            Some(max) => {
                let held = self.inner.index.lock().total_bytes_excluding(exclude);
                (held + incoming).saturating_sub(max)
            }
            None => 0,
        };
        let disk_deficit = if self.inner.min_free_disk > 0 {
            let root = self.inner.layout.root().to_path_buf();
            let available = run_blocking(move || Ok(fs2::available_space(&root)?)).await?;
            disk_deficit(self.inner.min_free_disk, incoming, available)
        } else {
            0
        };

        let deficit = quota_deficit.max(disk_deficit);
        if deficit > 0 {
            self.evict(deficit, exclude).await?;
        }
        Ok(())
    }

    /// Evict least recently used unprotected blobs. Caller holds the gate.
    ///
    /// Fails without evicting anything if unprotected blobs cannot cover
    /// `needed`.
    async fn evict(&self, needed: u64, exclude: (&str, &str)) -> Result<u64> {
        let candidates = self.inner.index.lock().eviction_candidates(exclude);
        let available: u64 = candidates.iter().map(|v| v.size).sum();
        if available < needed {
            warn!(needed, available, "cannot reclaim enough cache space");
            return Err(FsError::InsufficientSpace { needed, available });
        }

        let mut freed = 0;
        let victims: Vec<Victim> = candidates
            .into_iter()
            .take_while(|v| {
                let take = freed < needed;
                freed += v.size;
                take
            })
            .collect();
        let freed: u64 = victims.iter().map(|v| v.size).sum();

        {
            let mut index = self.inner.index.lock();
            for v in &victims {
                index.remove_blob(&v.resource_id, &v.hash);
            }
        }
        let layout = self.inner.layout.clone();
        let count = victims.len();
        run_blocking(move || {
            for v in &victims {
                remove_if_exists(&layout.blob_path(v.subdir, &v.resource_id, &v.hash))?;
            }
            Ok(())
        })
        .await?;

        info!(blobs = count, freed, needed, "evicted cached blobs");
        Ok(freed)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn stage_blob(source: &Path, staging: &Path, mode: StoreMode) -> Result<u64> {
    match mode {
        StoreMode::Move => {
            if std::fs::rename(source, staging).is_err() {
                std::fs::copy(source, staging)?;
                std::fs::remove_file(source)?;
            }
        }
        StoreMode::Copy => {
            std::fs::copy(source, staging)?;
        }
    }
    Ok(std::fs::metadata(staging)?.len())
}

/// Rebuild the index from disk, repairing what an unclean shutdown can
/// leave behind. Returns the index and the number of repairs.
fn scan(layout: &CacheLayout) -> io::Result<(CacheIndex, usize)> {
    layout.create_dirs()?;
    let mut healed = 0;
    let mut found: HashMap<(String, String), (CacheSubdir, u64, SystemTime)> = HashMap::new();

    for subdir in CacheSubdir::BLOB_DIRS {
        for dirent in std::fs::read_dir(layout.subdir(subdir))? {
            let dirent = dirent?;
            let metadata = dirent.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let name = dirent.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                debug!(file = %name, "deleting interrupted write");
                remove_if_exists(&dirent.path())?;
                healed += 1;
                continue;
            }
            let Some(key) = parse_blob_file_name(&name) else {
                debug!(file = %name, "ignoring foreign file in cache");
                continue;
            };
            if found.contains_key(&key) {
                debug!(file = %name, subdir = subdir.name(), "deleting shadowed duplicate blob");
                remove_if_exists(&dirent.path())?;
                healed += 1;
                continue;
            }
            let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
            found.insert(key, (subdir, metadata.len(), modified));
        }
    }

    let mut pinned = HashSet::new();
    for dirent in std::fs::read_dir(layout.subdir(CacheSubdir::Pinned))? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        match parse_blob_file_name(&name) {
            Some(key) if found.contains_key(&key) => {
                pinned.insert(key);
            }
            _ => {
                debug!(file = %name, "deleting dangling pin marker");
                remove_if_exists(&dirent.path())?;
                healed += 1;
            }
        }
    }

    let mut ordered: Vec<_> = found.into_iter().collect();
    ordered.sort_by_key(|(_, (_, _, modified))| *modified);

    let mut index = CacheIndex::default();
    for ((rid, hash), (mut subdir, size, _)) in ordered {
        let is_pinned = pinned.contains(&(rid.clone(), hash.clone()));
        let dirty = subdir == CacheSubdir::Outgoing;
        let wanted = CacheSubdir::for_flags(is_pinned, dirty);
        if wanted != subdir {
            std::fs::rename(
                layout.blob_path(subdir, &rid, &hash),
                layout.blob_path(wanted, &rid, &hash),
            )?;
            subdir = wanted;
            healed += 1;
        }
        let tick = index.touch();
        let resource = index.resources.entry(rid).or_default();
        resource.current = Some(hash.clone());
        resource.blobs.insert(
            hash,
            BlobEntry {
                subdir,
                pinned: is_pinned,
                dirty,
                size,
                last_access: tick,
            },
        );
    }
    Ok((index, healed))
}

/// Bytes to reclaim so that writing `incoming` keeps `min_free` available.
fn disk_deficit(min_free: u64, incoming: u64, available: u64) -> u64 {
    min_free.saturating_add(incoming).saturating_sub(available)
}
