//! In-memory document service.
//!
//! Keeps a whole remote account in a map. Used by the demo binary and by
//! tests, which can inject failures, slow downloads down and count calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::time::sleep;

use super::error::{ServiceError, ServiceErrorCode, ServiceResult};
use super::service::{AccountMetadata, ChunkOutcome, DocumentService, UploadRequest};
use crate::progress::{ProgressCallback, TransferProgress};

const SCHEME: &str = "memory://";
const DOWNLOAD_BLOCK: usize = 64 * 1024;

/// Remote calls that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceCall {
    Authenticate,
    FetchFeed,
    AccountMetadata,
    Download,
    InitiateUpload,
    SendChunk,
    QueryUpload,
    CreateDirectory,
    CopyDocument,
    DeleteEntry,
    RenameEntry,
    AddToParent,
    RemoveFromParent,
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    kind: &'static str,
    title: String,
    parent: Option<String>,
    content: Vec<u8>,
    updated: i64,
}

impl RemoteEntry {
    fn is_folder(&self) -> bool {
        self.kind == "folder"
    }

    fn is_hosted(&self) -> bool {
        matches!(
            self.kind,
            "document" | "spreadsheet" | "presentation" | "drawing"
        )
    }
}

struct UploadSession {
    request: UploadRequest,
    received: Vec<u8>,
}

struct State {
    entries: BTreeMap<String, RemoteEntry>,
    sessions: HashMap<String, UploadSession>,
    failures: HashMap<ServiceCall, VecDeque<ServiceError>>,
    calls: HashMap<ServiceCall, usize>,
    next_id: u64,
    page_size: Option<usize>,
    bytes_total: u64,
    download_delay: Duration,
}

/// A [`DocumentService`] backed by process memory.
pub struct MemoryDocumentService {
    state: Mutex<State>,
}

impl Default for MemoryDocumentService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                sessions: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                next_id: 1,
                page_size: None,
                bytes_total: 15 * 1024 * 1024 * 1024,
                download_delay: Duration::ZERO,
            }),
        }
    }

    /// Content hash reported for `bytes` in feed entries.
    pub fn content_hash_of(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn edit_url_for(resource_id: &str) -> String {
        format!("{SCHEME}edit/{resource_id}")
    }

    pub fn content_url_for(resource_id: &str) -> String {
        format!("{SCHEME}content/{resource_id}")
    }

    pub fn add_folder(&self, resource_id: &str, title: &str, parent: Option<&str>) {
        self.insert(resource_id, "folder", title, parent, Vec::new());
    }

    pub fn add_file(&self, resource_id: &str, title: &str, parent: Option<&str>, content: &[u8]) {
        self.insert(resource_id, "file", title, parent, content.to_vec());
    }

    pub fn add_hosted_document(&self, resource_id: &str, title: &str, parent: Option<&str>) {
        self.insert(resource_id, "document", title, parent, Vec::new());
    }

    /// Replace the content of a file, giving it a new content hash.
    pub fn set_content(&self, resource_id: &str, content: &[u8]) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(resource_id) {
            entry.content = content.to_vec();
            entry.updated = now();
        }
    }

    pub fn remove(&self, resource_id: &str) {
        let mut state = self.state.lock();
        remove_recursive(&mut state.entries, resource_id);
    }

    /// Split feeds into pages of at most `size` entries.
    pub fn set_page_size(&self, size: usize) {
        self.state.lock().page_size = Some(size.max(1));
    }

    /// Sleep this long before every download starts writing.
    pub fn set_download_delay(&self, delay: Duration) {
        self.state.lock().download_delay = delay;
    }

    /// Make the next call of kind `call` fail with `err`. Queued failures
    /// are consumed in order.
    pub fn fail_next(&self, call: ServiceCall, err: ServiceError) {
        self.state
            .lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(err);
    }

    pub fn call_count(&self, call: ServiceCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.state.lock().entries.contains_key(resource_id)
    }

    pub fn parent_of(&self, resource_id: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .get(resource_id)
            .and_then(|e| e.parent.clone())
    }

    pub fn title_of(&self, resource_id: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .get(resource_id)
            .map(|e| e.title.clone())
    }

    pub fn content_of(&self, resource_id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .entries
            .get(resource_id)
            .map(|e| e.content.clone())
    }

    /// Resource id of the first entry titled `title`.
    pub fn find_by_title(&self, title: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|(_, e)| e.title == title)
            .map(|(rid, _)| rid.clone())
    }

    fn insert(
        &self,
        resource_id: &str,
        kind: &'static str,
        title: &str,
        parent: Option<&str>,
        content: Vec<u8>,
    ) {
        self.state.lock().entries.insert(
            resource_id.to_string(),
            RemoteEntry {
                kind,
                title: title.to_string(),
                parent: parent.map(str::to_string),
                content,
                updated: now(),
            },
        );
    }

    /// Count the call and pop an injected failure, if any.
    fn enter(&self, call: ServiceCall) -> ServiceResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(call).or_default() += 1;
        match state.failures.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A fresh id that no seeded or created entry already uses.
    fn next_resource_id(state: &mut State, prefix: &str) -> String {
        loop {
            let id = format!("{prefix}:{}", state.next_id);
            state.next_id += 1;
            if !state.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn session_gone() -> ServiceError {
    ServiceError::new(ServiceErrorCode::Gone, "Upload session")
}

fn not_found(what: &str) -> ServiceError {
    ServiceError::new(ServiceErrorCode::NotFound, format!("{what} does not exist"))
}

fn strip_locator<'a>(url: &'a str, kind: &str) -> ServiceResult<&'a str> {
    url.strip_prefix(SCHEME)
        .and_then(|rest| rest.strip_prefix(kind))
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| {
            ServiceError::new(
                ServiceErrorCode::BadRequest,
                format!("Unrecognized locator: {url}"),
            )
        })
}

/// Parent resource id of a directory locator; `None` is the root collection.
fn parent_from_locator(url: &str, kind: &str) -> ServiceResult<Option<String>> {
    let id = strip_locator(url, kind)?;
    Ok((id != "root").then(|| id.to_string()))
}

fn remove_recursive(entries: &mut BTreeMap<String, RemoteEntry>, resource_id: &str) {
    let children: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.parent.as_deref() == Some(resource_id))
        .map(|(rid, _)| rid.clone())
        .collect();
    for child in children {
        remove_recursive(entries, &child);
    }
    entries.remove(resource_id);
}

fn entry_json(resource_id: &str, entry: &RemoteEntry) -> Value {
    let mut value = json!({
        "kind": entry.kind,
        "resource_id": resource_id,
        "title": entry.title,
        "edit_url": MemoryDocumentService::edit_url_for(resource_id),
        "updated": entry.updated,
        "created": entry.updated,
        "read_only": false,
    });
    if let Some(parent) = &entry.parent {
        value["parent"] = json!(parent);
    }
    if entry.is_folder() {
        value["content_url"] = json!(format!("{SCHEME}feeds/{resource_id}"));
        value["upload_url"] = json!(format!("{SCHEME}upload/{resource_id}"));
    } else if entry.is_hosted() {
        value["content_url"] = json!(format!("{SCHEME}export/{resource_id}"));
        value["size"] = json!(0);
    } else {
        value["content_url"] = json!(MemoryDocumentService::content_url_for(resource_id));
        value["md5"] = json!(MemoryDocumentService::content_hash_of(&entry.content));
        value["size"] = json!(entry.content.len());
    }
    value
}

/// Build one page of `(rid, entry)` pairs, linking to the next page if any.
fn page(
    listed: Vec<(&String, &RemoteEntry)>,
    base: &str,
    start: usize,
    page_size: Option<usize>,
) -> Value {
    let size = page_size.unwrap_or(usize::MAX);
    let entries: Vec<Value> = listed
        .iter()
        .skip(start)
        .take(size)
        .map(|(rid, e)| entry_json(rid, e))
        .collect();
    let end = start.saturating_add(size);
    let mut value = json!({ "entries": entries });
    if end < listed.len() {
        value["next"] = json!(format!("{base}?start={end}"));
    }
    value
}

#[async_trait]
impl DocumentService for MemoryDocumentService {
    fn root_content_url(&self) -> String {
        format!("{SCHEME}feeds/root")
    }

    fn root_upload_url(&self) -> String {
        format!("{SCHEME}upload/root")
    }

    async fn authenticate(&self) -> ServiceResult<String> {
        self.enter(ServiceCall::Authenticate)?;
        Ok("memory-token".to_string())
    }

    async fn fetch_feed(&self, url: Option<&str>) -> ServiceResult<Value> {
        self.enter(ServiceCall::FetchFeed)?;
        let url = url.unwrap_or("memory://all");
        let (base, start) = match url.split_once("?start=") {
            Some((base, start)) => (
                base,
                start.parse::<usize>().map_err(|_| {
                    ServiceError::new(ServiceErrorCode::BadRequest, "Bad page offset")
                })?,
            ),
            None => (url, 0),
        };

        let state = self.state.lock();
        let listed: Vec<(&String, &RemoteEntry)> = if base == "memory://all" {
            state.entries.iter().collect()
        } else {
            let dir = parent_from_locator(base, "feeds")?;
            if let Some(dir) = &dir {
                if !state.entries.contains_key(dir) {
                    return Err(not_found("Collection"));
                }
            }
            state
                .entries
                .iter()
                .filter(|(_, e)| e.parent == dir)
                .collect()
        };
        Ok(page(listed, base, start, state.page_size))
    }

    async fn account_metadata(&self) -> ServiceResult<AccountMetadata> {
        self.enter(ServiceCall::AccountMetadata)?;
        let state = self.state.lock();
        let bytes_used = state.entries.values().map(|e| e.content.len() as u64).sum();
        Ok(AccountMetadata {
            bytes_total: state.bytes_total,
            bytes_used,
        })
    }

    async fn download(
        &self,
        content_url: &str,
        destination: &Path,
        mut progress: ProgressCallback,
    ) -> ServiceResult<u64> {
        self.enter(ServiceCall::Download)?;
        let resource_id = strip_locator(content_url, "content")?.to_string();
        let delay = self.state.lock().download_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let (title, content) = {
            let state = self.state.lock();
            let entry = state
                .entries
                .get(&resource_id)
                .ok_or_else(|| not_found("File"))?;
            (entry.title.clone(), entry.content.clone())
        };

        let total = content.len() as u64;
        let mut done = 0u64;
        for block in content.chunks(DOWNLOAD_BLOCK) {
            done += block.len() as u64;
            if !progress(&TransferProgress::new(done, total, title.as_str())) {
                return Err(ServiceError::new(
                    ServiceErrorCode::Cancelled,
                    "Download cancelled",
                ));
            }
        }
        if content.is_empty() && !progress(&TransferProgress::new(0, 0, title.as_str())) {
            return Err(ServiceError::new(
                ServiceErrorCode::Cancelled,
                "Download cancelled",
            ));
        }

        tokio::fs::write(destination, &content)
            .await
            .map_err(|e| ServiceError::new(ServiceErrorCode::Internal, e.to_string()))?;
        Ok(total)
    }

    async fn initiate_upload(&self, request: UploadRequest) -> ServiceResult<String> {
        self.enter(ServiceCall::InitiateUpload)?;
        let parent = parent_from_locator(&request.parent_locator, "upload")?;
        let mut state = self.state.lock();
        if let Some(parent) = &parent {
            if !state.entries.get(parent).is_some_and(RemoteEntry::is_folder) {
                return Err(not_found("Collection"));
            }
        }
        let session = format!("{SCHEME}session/{}", state.next_id);
        state.next_id += 1;
        state.sessions.insert(
            session.clone(),
            UploadSession {
                request,
                received: Vec::new(),
            },
        );
        Ok(session)
    }

    async fn send_chunk(
        &self,
        session: &str,
        offset: u64,
        bytes: Vec<u8>,
        total: u64,
    ) -> ServiceResult<ChunkOutcome> {
        self.enter(ServiceCall::SendChunk)?;
        let mut state = self.state.lock();
        let upload = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| session_gone())?;

        if offset > upload.received.len() as u64 {
            return Err(ServiceError::new(
                ServiceErrorCode::PreconditionFailed,
                "Chunk offset beyond received range",
            ));
        }
        upload.received.truncate(offset as usize);
        upload.received.extend_from_slice(&bytes);

        let received = upload.received.len() as u64;
        if received < total {
            return Ok(ChunkOutcome::Incomplete {
                next_offset: received,
            });
        }

        let Some(upload) = state.sessions.remove(session) else {
            return Err(session_gone());
        };
        let parent = parent_from_locator(&upload.request.parent_locator, "upload")?;
        let resource_id = Self::next_resource_id(&mut state, "file");
        let entry = RemoteEntry {
            kind: "file",
            title: upload.request.title,
            parent,
            content: upload.received,
            updated: now(),
        };
        let value = entry_json(&resource_id, &entry);
        state.entries.insert(resource_id, entry);
        Ok(ChunkOutcome::Complete(value))
    }

    async fn query_upload(&self, session: &str) -> ServiceResult<u64> {
        self.enter(ServiceCall::QueryUpload)?;
        let state = self.state.lock();
        state
            .sessions
            .get(session)
            .map(|s| s.received.len() as u64)
            .ok_or_else(|| session_gone())
    }

    async fn create_directory(
        &self,
        parent_content_url: &str,
        title: &str,
    ) -> ServiceResult<Value> {
        self.enter(ServiceCall::CreateDirectory)?;
        let parent = parent_from_locator(parent_content_url, "feeds")?;
        let mut state = self.state.lock();
        if let Some(parent) = &parent {
            if !state.entries.get(parent).is_some_and(RemoteEntry::is_folder) {
                return Err(not_found("Collection"));
            }
        }
        let resource_id = Self::next_resource_id(&mut state, "folder");
        let entry = RemoteEntry {
            kind: "folder",
            title: title.to_string(),
            parent,
            content: Vec::new(),
            updated: now(),
        };
        let value = entry_json(&resource_id, &entry);
        state.entries.insert(resource_id, entry);
        Ok(value)
    }

    async fn copy_document(&self, resource_id: &str, title: &str) -> ServiceResult<Value> {
        self.enter(ServiceCall::CopyDocument)?;
        let mut state = self.state.lock();
        let source = state
            .entries
            .get(resource_id)
            .ok_or_else(|| not_found("Document"))?;
        if !source.is_hosted() {
            return Err(ServiceError::new(
                ServiceErrorCode::BadRequest,
                "Only hosted documents can be copied",
            ));
        }
        let entry = RemoteEntry {
            kind: source.kind,
            title: title.to_string(),
            parent: None,
            content: Vec::new(),
            updated: now(),
        };
        let copy_id = Self::next_resource_id(&mut state, "document");
        let value = entry_json(&copy_id, &entry);
        state.entries.insert(copy_id, entry);
        Ok(value)
    }

    async fn delete_entry(&self, edit_url: &str) -> ServiceResult<()> {
        self.enter(ServiceCall::DeleteEntry)?;
        let resource_id = strip_locator(edit_url, "edit")?;
        let mut state = self.state.lock();
        if !state.entries.contains_key(resource_id) {
            return Err(not_found("Entry"));
        }
        remove_recursive(&mut state.entries, resource_id);
        Ok(())
    }

    async fn rename_entry(&self, edit_url: &str, title: &str) -> ServiceResult<()> {
        self.enter(ServiceCall::RenameEntry)?;
        let resource_id = strip_locator(edit_url, "edit")?;
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(resource_id)
            .ok_or_else(|| not_found("Entry"))?;
        entry.title = title.to_string();
        entry.updated = now();
        Ok(())
    }

    async fn add_to_parent(&self, parent_content_url: &str, edit_url: &str) -> ServiceResult<()> {
        self.enter(ServiceCall::AddToParent)?;
        let parent = parent_from_locator(parent_content_url, "feeds")?;
        let resource_id = strip_locator(edit_url, "edit")?;
        let mut state = self.state.lock();
        if let Some(parent) = &parent {
            if !state.entries.get(parent).is_some_and(RemoteEntry::is_folder) {
                return Err(not_found("Collection"));
            }
        }
        let entry = state
            .entries
            .get_mut(resource_id)
            .ok_or_else(|| not_found("Entry"))?;
        entry.parent = parent;
        Ok(())
    }

    async fn remove_from_parent(
        &self,
        parent_content_url: &str,
        resource_id: &str,
    ) -> ServiceResult<()> {
        self.enter(ServiceCall::RemoveFromParent)?;
        let parent = parent_from_locator(parent_content_url, "feeds")?;
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(resource_id)
            .ok_or_else(|| not_found("Entry"))?;
        // An entry taken out of its only collection falls back to the root.
        if entry.parent == parent {
            entry.parent = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::noop_progress;

    #[tokio::test]
    async fn test_feed_pagination() {
        let service = MemoryDocumentService::new();
        service.add_folder("f1", "A", None);
        service.add_file("a1", "one.txt", Some("f1"), b"1");
        service.add_file("a2", "two.txt", Some("f1"), b"2");
        service.set_page_size(2);

        let first = service.fetch_feed(None).await.unwrap();
        assert_eq!(first["entries"].as_array().unwrap().len(), 2);
        let next = first["next"].as_str().unwrap().to_string();

        let second = service.fetch_feed(Some(&next)).await.unwrap();
        assert_eq!(second["entries"].as_array().unwrap().len(), 1);
        assert!(second.get("next").is_none());
    }

    #[tokio::test]
    async fn test_created_ids_skip_seeded_ones() {
        let service = MemoryDocumentService::new();
        service.add_folder("folder:1", "Docs", None);
        service.add_folder("folder:2", "More", None);

        let created = service
            .create_directory("memory://feeds/folder:1", "Mine")
            .await
            .unwrap();

        let id = created["resource_id"].as_str().unwrap();
        assert_ne!(id, "folder:1");
        assert_ne!(id, "folder:2");
        assert!(id.starts_with("folder:"));
    }

    #[tokio::test]
    async fn test_directory_feed_lists_direct_children() {
        let service = MemoryDocumentService::new();
        service.add_folder("f1", "A", None);
        service.add_folder("f2", "B", Some("f1"));
        service.add_file("a1", "deep.txt", Some("f2"), b"x");

        let feed = service.fetch_feed(Some("memory://feeds/f1")).await.unwrap();
        let entries = feed["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["resource_id"], "f2");
    }

    #[tokio::test]
    async fn test_chunked_upload_creates_entry() {
        let service = MemoryDocumentService::new();
        let session = service
            .initiate_upload(UploadRequest {
                title: "up.bin".to_string(),
                content_type: "application/octet-stream".to_string(),
                content_length: 4,
                parent_locator: "memory://upload/root".to_string(),
            })
            .await
            .unwrap();

        let outcome = service.send_chunk(&session, 0, b"ab".to_vec(), 4).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Incomplete { next_offset: 2 });
        assert_eq!(service.query_upload(&session).await.unwrap(), 2);

        let ChunkOutcome::Complete(entry) =
            service.send_chunk(&session, 2, b"cd".to_vec(), 4).await.unwrap()
        else {
            panic!("upload should be complete");
        };
        let rid = entry["resource_id"].as_str().unwrap();
        assert_eq!(service.content_of(rid).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_download_cancelled_by_progress() {
        let dir = tempfile::tempdir().unwrap();
        let service = MemoryDocumentService::new();
        service.add_file("a1", "a.txt", None, b"hello");

        let err = service
            .download(
                &MemoryDocumentService::content_url_for("a1"),
                &dir.path().join("out"),
                Box::new(|_| false),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ServiceErrorCode::Cancelled);

        let bytes = service
            .download(
                &MemoryDocumentService::content_url_for("a1"),
                &dir.path().join("out"),
                noop_progress(),
            )
            .await
            .unwrap();
        assert_eq!(bytes, 5);
    }

    #[tokio::test]
    async fn test_remove_from_parent_falls_back_to_root() {
        let service = MemoryDocumentService::new();
        service.add_folder("f1", "A", None);
        service.add_file("a1", "a.txt", Some("f1"), b"x");

        service
            .remove_from_parent("memory://feeds/f1", "a1")
            .await
            .unwrap();
        assert_eq!(service.parent_of("a1"), None);
    }
}
