//! Single-task execution context for remote-service calls.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::error::ServiceResult;
use super::service::{AccountMetadata, ChunkOutcome, DocumentService, UploadRequest};
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::progress::ProgressCallback;

const MAX_RETRY_DELAY_MS: u64 = 16_000;

/// Cloneable handle to the remote-service actor.
///
/// Every call is queued and executed in order on the actor task. Once the
/// actor has shut down, calls fail with [`FsError::Stopped`].
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ServiceCommand>,
}

enum ServiceCommand {
    Authenticate {
        reply: oneshot::Sender<ServiceResult<String>>,
    },
    FetchFeed {
        url: Option<String>,
        reply: oneshot::Sender<ServiceResult<Value>>,
    },
    AccountMetadata {
        reply: oneshot::Sender<ServiceResult<AccountMetadata>>,
    },
    Download {
        content_url: String,
        destination: PathBuf,
        progress: ProgressCallback,
        reply: oneshot::Sender<ServiceResult<u64>>,
    },
    InitiateUpload {
        request: UploadRequest,
        reply: oneshot::Sender<ServiceResult<String>>,
    },
    SendChunk {
        session: String,
        offset: u64,
        bytes: Vec<u8>,
        total: u64,
        reply: oneshot::Sender<ServiceResult<ChunkOutcome>>,
    },
    QueryUpload {
        session: String,
        reply: oneshot::Sender<ServiceResult<u64>>,
    },
    CreateDirectory {
        parent_content_url: String,
        title: String,
        reply: oneshot::Sender<ServiceResult<Value>>,
    },
    CopyDocument {
        resource_id: String,
        title: String,
        reply: oneshot::Sender<ServiceResult<Value>>,
    },
    DeleteEntry {
        edit_url: String,
        reply: oneshot::Sender<ServiceResult<()>>,
    },
    RenameEntry {
        edit_url: String,
        title: String,
        reply: oneshot::Sender<ServiceResult<()>>,
    },
    AddToParent {
        parent_content_url: String,
        edit_url: String,
        reply: oneshot::Sender<ServiceResult<()>>,
    },
    RemoveFromParent {
        parent_content_url: String,
        resource_id: String,
        reply: oneshot::Sender<ServiceResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct ServiceActor {
    service: Arc<dyn DocumentService>,
    rx: mpsc::Receiver<ServiceCommand>,
    read_retry_attempts: u32,
    retry_base_delay: Duration,
}

impl ServiceHandle {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(service: Arc<dyn DocumentService>, config: &FsConfig) -> Self {
        ServiceActor::spawn(service, config)
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<ServiceResult<R>>) -> ServiceCommand,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        let cmd = build(tx);
        self.tx.send(cmd).await.map_err(|_| FsError::Stopped)?;
        let res = rx.await.map_err(|_| FsError::Stopped)?;
        Ok(res?)
    }

    pub async fn authenticate(&self) -> Result<String> {
        self.request(|reply| ServiceCommand::Authenticate { reply })
            .await
    }

    pub async fn fetch_feed(&self, url: Option<&str>) -> Result<Value> {
        self.request(|reply| ServiceCommand::FetchFeed {
            url: url.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn account_metadata(&self) -> Result<AccountMetadata> {
        self.request(|reply| ServiceCommand::AccountMetadata { reply })
            .await
    }

    pub async fn download(
        &self,
        content_url: &str,
        destination: PathBuf,
        progress: ProgressCallback,
    ) -> Result<u64> {
        self.request(|reply| ServiceCommand::Download {
            content_url: content_url.to_string(),
            destination,
            progress,
            reply,
        })
        .await
    }

    pub async fn initiate_upload(&self, request: UploadRequest) -> Result<String> {
        self.request(|reply| ServiceCommand::InitiateUpload { request, reply })
            .await
    }

    pub async fn send_chunk(
        &self,
        session: &str,
        offset: u64,
        bytes: Vec<u8>,
        total: u64,
    ) -> Result<ChunkOutcome> {
        self.request(|reply| ServiceCommand::SendChunk {
            session: session.to_string(),
            offset,
            bytes,
            total,
            reply,
        })
        .await
    }

    pub async fn query_upload(&self, session: &str) -> Result<u64> {
        self.request(|reply| ServiceCommand::QueryUpload {
            session: session.to_string(),
            reply,
        })
        .await
    }

    pub async fn create_directory(&self, parent_content_url: &str, title: &str) -> Result<Value> {
        self.request(|reply| ServiceCommand::CreateDirectory {
            parent_content_url: parent_content_url.to_string(),
            title: title.to_string(),
            reply,
        })
        .await
    }

    pub async fn copy_document(&self, resource_id: &str, title: &str) -> Result<Value> {
        self.request(|reply| ServiceCommand::CopyDocument {
            resource_id: resource_id.to_string(),
            title: title.to_string(),
            reply,
        })
        .await
    }

    pub async fn delete_entry(&self, edit_url: &str) -> Result<()> {
        self.request(|reply| ServiceCommand::DeleteEntry {
            edit_url: edit_url.to_string(),
            reply,
        })
        .await
    }

    pub async fn rename_entry(&self, edit_url: &str, title: &str) -> Result<()> {
        self.request(|reply| ServiceCommand::RenameEntry {
            edit_url: edit_url.to_string(),
            title: title.to_string(),
            reply,
        })
        .await
    }

    pub async fn add_to_parent(&self, parent_content_url: &str, edit_url: &str) -> Result<()> {
        self.request(|reply| ServiceCommand::AddToParent {
            parent_content_url: parent_content_url.to_string(),
            edit_url: edit_url.to_string(),
            reply,
        })
        .await
    }

    pub async fn remove_from_parent(&self, parent_content_url: &str, resource_id: &str) -> Result<()> {
        self.request(|reply| ServiceCommand::RemoveFromParent {
            parent_content_url: parent_content_url.to_string(),
            resource_id: resource_id.to_string(),
            reply,
        })
        .await
    }

    /// Stop the actor after the commands already queued.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(ServiceCommand::Shutdown { reply: tx }).await;
        let _ = rx.await;
    }
}

impl ServiceActor {
    fn spawn(service: Arc<dyn DocumentService>, config: &FsConfig) -> ServiceHandle {
        let (tx, rx) = mpsc::channel(config.service_queue_depth.max(1));
        let actor = ServiceActor {
            service,
            rx,
            read_retry_attempts: config.read_retry_attempts,
            retry_base_delay: config.retry_base_delay(),
        };
        tokio::spawn(actor.run());
        ServiceHandle { tx }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            if self.handle_command(cmd).await {
                break;
            }
        }
        debug!("remote service actor stopped");
    }

    /// Retry an idempotent read on transient failures with exponential backoff.
    async fn with_read_retry<T, F, Fut>(&self, what: &str, mut call: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let mut delay_ms = self.retry_base_delay.as_millis() as u64;
        let mut attempts = 0;

        loop {
            match call().await {
                Err(err) if err.code.is_transient() && attempts < self.read_retry_attempts => {
                    attempts += 1;
                    let jitter = rand::thread_rng().gen_range(0..=delay_ms / 4);
                    warn!(
                        call = what,
                        attempt = attempts,
                        delay_ms = delay_ms + jitter,
                        error = %err,
                        "transient service failure, retrying"
                    );
                    sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
                }
                res => return res,
            }
        }
    }

    async fn handle_command(&mut self, cmd: ServiceCommand) -> bool {
        match cmd {
            ServiceCommand::Authenticate { reply } => {
                let res = self.service.authenticate().await;
                let _ = reply.send(res);
            }
            ServiceCommand::FetchFeed { url, reply } => {
                let service = &self.service;
                let res = self
                    .with_read_retry("fetch_feed", || service.fetch_feed(url.as_deref()))
                    .await;
                let _ = reply.send(res);
            }
            ServiceCommand::AccountMetadata { reply } => {
                let service = &self.service;
                let res = self
                    .with_read_retry("account_metadata", || service.account_metadata())
                    .await;
                let _ = reply.send(res);
            }
            ServiceCommand::Download {
                content_url,
                destination,
                progress,
                reply,
            } => {
                let res = self
                    .service
                    .download(&content_url, &destination, progress)
                    .await;
                let _ = reply.send(res);
            }
            ServiceCommand::InitiateUpload { request, reply } => {
                let res = self.service.initiate_upload(request).await;
                let _ = reply.send(res);
            }
            ServiceCommand::SendChunk {
                session,
                offset,
                bytes,
                total,
                reply,
            } => {
                let res = self.service.send_chunk(&session, offset, bytes, total).await;
                let _ = reply.send(res);
            }
            ServiceCommand::QueryUpload { session, reply } => {
                let res = self.service.query_upload(&session).await;
                let _ = reply.send(res);
            }
            ServiceCommand::CreateDirectory {
                parent_content_url,
                title,
                reply,
            } => {
                let res = self
                    .service
                    .create_directory(&parent_content_url, &title)
                    .await;
                let _ = reply.send(res);
            }
            ServiceCommand::CopyDocument {
                resource_id,
                title,
                reply,
            } => {
                let res = self.service.copy_document(&resource_id, &title).await;
                let _ = reply.send(res);
            }
            ServiceCommand::DeleteEntry { edit_url, reply } => {
                let res = self.service.delete_entry(&edit_url).await;
                let _ = reply.send(res);
            }
            ServiceCommand::RenameEntry {
                edit_url,
                title,
                reply,
            } => {
                let res = self.service.rename_entry(&edit_url, &title).await;
                let _ = reply.send(res);
            }
            ServiceCommand::AddToParent {
                parent_content_url,
                edit_url,
                reply,
            } => {
                let res = self
                    .service
                    .add_to_parent(&parent_content_url, &edit_url)
                    .await;
                let _ = reply.send(res);
            }
            ServiceCommand::RemoveFromParent {
                parent_content_url,
                resource_id,
                reply,
            } => {
                let res = self
                    .service
                    .remove_from_parent(&parent_content_url, &resource_id)
                    .await;
                let _ = reply.send(res);
            }
            ServiceCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }
}
