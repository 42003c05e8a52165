//! Resumable uploads.
//!
//! An upload opens a session with the service and sends the file in chunks.
//! The acknowledged offset is saved after every chunk, so an interrupted
//! upload can continue from there with [`FileSystem::resume_upload`].

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Destination;
use super::super::locate;
use crate::api::{ChunkOutcome, UploadRequest};
use crate::cache::{CachedFileOrigin, StoreMode, run_blocking};
use crate::error::{FsError, Result};
use crate::filesystem::FileSystem;
use crate::fs::upload_state::calculate_file_hash;
use crate::fs::utils::{normalize_path, parent_and_name};
use crate::fs::{ContentOrigin, Node, UploadState, parse_entry};
use crate::progress::{TransferKind, TransferOutcome};
use crate::registry::OperationId;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(16);

impl FileSystem {
    /// Upload the local file `source` as the new file `destination`.
    pub async fn upload(&self, source: &Path, destination: &str) -> Result<Node> {
        let dest = self.resolve_destination(destination).await?;
        let state = self.open_upload_session(source, &dest).await?;
        self.send_upload(state, source).await
    }

    /// Continue an interrupted upload of `source` to `destination`.
    ///
    /// Falls back to a fresh upload when there is no saved session, the
    /// file changed since, the session is too old, or the service no
    /// longer knows it.
    pub async fn resume_upload(&self, source: &Path, destination: &str) -> Result<Node> {
        self.ensure_running()?;
        let dest_path = normalize_path(destination);
        let saved = match self.inner.meta.load_upload_state(source, &dest_path).await {
            Ok(saved) => saved,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable upload state");
                None
            }
        };

        if let Some(mut state) = saved {
            if self.upload_state_matches(&state, source).await {
                match self.inner.service.query_upload(&state.session_url).await {
                    Ok(offset) => {
                        state.advance(offset);
                        info!(path = %dest_path, offset, "resuming upload");
                        match self.send_upload(state, source).await {
                            Err(FsError::SessionExpired(msg)) => {
                                warn!(error = %msg, "upload session lost, starting over")
                            }
                            other => return other,
                        }
                    }
                    Err(err) => warn!(error = %err, "saved upload session unusable, starting over"),
                }
            } else {
                info!(path = %dest_path, "saved upload state is stale, starting over");
            }
            if let Err(err) = self.inner.meta.delete_upload_state(source, &dest_path).await {
                warn!(error = %err, "failed to delete upload state");
            }
        }

        self.upload(source, destination).await
    }

    async fn upload_state_matches(&self, state: &UploadState, source: &Path) -> bool {
        if !state.is_likely_valid(self.inner.config.upload_session_ttl_secs) {
            return false;
        }
        let Ok(meta) = tokio::fs::metadata(source).await else {
            return false;
        };
        let path = source.to_path_buf();
        let Ok(hash) = run_blocking(move || calculate_file_hash(&path)).await else {
            return false;
        };
        state.file_size == meta.len() && state.file_hash == hash
    }

    async fn open_upload_session(&self, source: &Path, dest: &Destination) -> Result<UploadState> {
        let size = tokio::fs::metadata(source).await?.len();
        let path = source.to_path_buf();
        let hash = run_blocking(move || calculate_file_hash(&path)).await?;
        let upload_url = dest
            .parent
            .as_directory()
            .map(|d| d.upload_url.clone())
            .ok_or_else(|| FsError::NotADirectory(dest.path.clone()))?;
        let content_type = content_type_for(&dest.title).to_string();

        let session = self
            .inner
            .service
            .initiate_upload(UploadRequest {
                title: dest.title.clone(),
                content_type: content_type.clone(),
                content_length: size,
                parent_locator: upload_url.clone(),
            })
            .await?;

        let state = UploadState::new(
            session,
            size,
            source.to_string_lossy().into_owned(),
            dest.path.clone(),
            dest.title.clone(),
            content_type,
            upload_url,
            hash,
        );
        self.inner.meta.save_upload_state(&state).await?;
        debug!(path = %dest.path, size, "opened upload session");
        Ok(state)
    }

    async fn send_upload(&self, mut state: UploadState, source: &Path) -> Result<Node> {
        let registry = &self.inner.registry;
        let (id, token) = registry.register(&state.destination, TransferKind::Upload, state.file_size);
        registry.update(id, state.offset, state.file_size);

        let result = match self.send_chunks(&mut state, source, id, &token).await {
            Ok(entry) => self.complete_upload(&state, source, &entry).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(node) => {
                if !registry.finish(id, TransferOutcome::Completed) {
                    return Err(FsError::Aborted);
                }
                Ok(node)
            }
            Err(err) => {
                let outcome = match &err {
                    FsError::Aborted => TransferOutcome::Cancelled,
                    other => TransferOutcome::Failed(other.to_string()),
                };
                registry.finish(id, outcome);
                Err(err)
            }
        }
    }

    async fn send_chunks(
        &self,
        state: &mut UploadState,
        source: &Path,
        id: OperationId,
        token: &CancellationToken,
    ) -> Result<Value> {
        let chunk_size = self.inner.config.upload_chunk_size.max(1) as u64;
        loop {
            if token.is_cancelled() {
                return Err(FsError::Aborted);
            }
            let offset = state.offset;
            let len = chunk_size.min(state.file_size - offset);
            let bytes = read_chunk(source.to_path_buf(), offset, len as usize).await?;

            match self
                .send_chunk_with_retry(&state.session_url, offset, bytes, state.file_size)
                .await?
            {
                ChunkOutcome::Incomplete { next_offset } => {
                    if next_offset <= offset {
                        return Err(FsError::ValidationError(format!(
                            "upload stalled at offset {}",
                            offset
                        )));
                    }
                    state.advance(next_offset);
                    self.inner.meta.save_upload_state(state).await?;
                    self.inner.registry.update(id, state.offset, state.file_size);
                }
                ChunkOutcome::Complete(entry) => {
                    self.inner
                        .registry
                        .update(id, state.file_size, state.file_size);
                    return Ok(entry);
                }
            }
        }
    }

    async fn send_chunk_with_retry(
        &self,
        session: &str,
        offset: u64,
        bytes: Vec<u8>,
        total: u64,
    ) -> Result<ChunkOutcome> {
        let mut delay = self.inner.config.retry_base_delay();
        let mut attempts = 0;
        loop {
            match self
                .inner
                .service
                .send_chunk(session, offset, bytes.clone(), total)
                .await
            {
                Err(err) if err.is_transient() && attempts < self.inner.config.chunk_retry_attempts => {
                    attempts += 1;
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    warn!(offset, attempt = attempts, error = %err, "chunk upload failed, retrying");
                    sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                res => return res,
            }
        }
    }

    async fn complete_upload(&self, state: &UploadState, source: &Path, entry: &Value) -> Result<Node> {
        let entry = parse_entry(entry)?;
        if let Err(err) = self
            .inner
            .meta
            .delete_upload_state(source, &state.destination)
            .await
        {
            warn!(error = %err, "failed to delete upload state");
        }

        // The uploaded bytes are the new content; keep them as a local copy.
        if let Some(hash) = entry.md5.as_deref() {
            let cache = &self.inner.cache;
            let cached = cache
                .store(
                    &entry.resource_id,
                    hash,
                    source,
                    CachedFileOrigin::LocallyModified,
                    StoreMode::Copy,
                )
                .await;
            match cached {
                Ok(_) => {
                    if let Err(err) = cache.commit(&entry.resource_id, hash).await {
                        warn!(error = %err, "failed to mark uploaded content clean");
                    }
                }
                Err(err) => warn!(error = %err, "uploaded content not cached"),
            }
        }

        let (parent_path, _) = parent_and_name(&state.destination)
            .ok_or_else(|| FsError::InvalidOperation(state.destination.clone()))?;
        let parent = self.resolve(&parent_path).await?;

        let node = {
            let mut tree = self.inner.tree.lock();
            match tree.find_by_resource_id(&entry.resource_id) {
                // A refresh already picked it up.
                Some(id) => tree.get(id).cloned(),
                None => {
                    let parent_id = locate(&tree, &parent.resource_id)
                        .ok_or_else(|| FsError::ParentNotFound(parent_path.clone()))?;
                    let mut new_node = entry.to_new_node(ContentOrigin::FromServer);
                    new_node.title = tree.unique_title(parent_id, &state.title);
                    let id = tree.add_child(parent_id, new_node)?;
                    tree.get(id).cloned()
                }
            }
        }
        .ok_or_else(|| FsError::NotFound(state.destination.clone()))?;

        info!(path = %state.destination, bytes = state.file_size, "uploaded file");
        self.notify_directory_changed(&parent_path);
        Ok(node)
    }
}

async fn read_chunk(source: PathBuf, offset: u64, len: usize) -> Result<Vec<u8>> {
    run_blocking(move || {
        let mut file = std::fs::File::open(&source)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    })
    .await
}

fn content_type_for(title: &str) -> &'static str {
    let ext = title
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}
