//! Chunked file transfer: downloads, uploads, retries and cancellation

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::api::{self, ProjectInfoResponse, PushStartRequest, PushStartResponse};
use crate::auth::AuthGate;
use crate::chunker;
use crate::config::{retry, ClientConfig, IO_CHUNK_SIZE};
use crate::diff::ChangeSet;
use crate::error::{Result, SyncError};
use crate::multipart::{safe_join, MultipartStreamParser};
use crate::project::FileEntry;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Cancellation handle shared between the caller and a running transfer.
/// Cloning hands out another handle to the same flag.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Where a transfer currently stands. Chunk indices are zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Planning,
    Transferring {
        file: String,
        chunk: usize,
        of: usize,
    },
    Retrying {
        file: String,
        chunk: usize,
        attempt: u32,
    },
    Done,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Files materialized locally (download) or shipped (upload).
    pub files: usize,
    /// Payload bytes moved, headers excluded.
    pub bytes: u64,
}

/// Drives one sync's worth of file traffic. Files move sequentially,
/// chunk by chunk; only chunk exchanges are retried, since everything
/// around them is either idempotent at a higher level or cheap to redo.
pub struct TransferManager<'a> {
    transport: &'a dyn Transport,
    auth: &'a AuthGate,
    cfg: &'a ClientConfig,
    cancel: CancelFlag,
    state: parking_lot::Mutex<TransferState>,
}

impl<'a> TransferManager<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        auth: &'a AuthGate,
        cfg: &'a ClientConfig,
        cancel: CancelFlag,
    ) -> Self {
        TransferManager {
            transport,
            auth,
            cfg,
            cancel,
            state: parking_lot::Mutex::new(TransferState::Idle),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state.lock().clone()
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
    }

    /// Fetches `files` of `full_name` at `version` into `project_dir`.
    ///
    /// A chunk response is normally a raw byte range that is appended into
    /// the file under assembly. The server may instead answer with a
    /// multipart batch carrying whole files; those are unpacked with
    /// conflict copies for anything already on disk, and every file the
    /// batch covered is dropped from the remaining queue.
    pub async fn download(
        &self,
        full_name: &str,
        version: &str,
        project_dir: &Path,
        files: &[FileEntry],
    ) -> Result<TransferStats> {
        self.set_state(TransferState::Planning);
        let result = self
            .download_inner(full_name, version, project_dir, files)
            .await;
        match &result {
            Ok(stats) => {
                debug!(project = full_name, files = stats.files, bytes = stats.bytes, "download done");
                self.set_state(TransferState::Done);
            }
            Err(err) => self.set_state(TransferState::Failed(err.to_string())),
        }
        result
    }

    async fn download_inner(
        &self,
        full_name: &str,
        version: &str,
        project_dir: &Path,
        files: &[FileEntry],
    ) -> Result<TransferStats> {
        let mut stats = TransferStats::default();
        let mut satisfied: HashSet<String> = HashSet::new();

        for file in files {
            if satisfied.contains(&file.path) {
                continue;
            }
            self.cancel.check()?;

            let target = safe_join(project_dir, &file.path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }

            let count = chunker::chunk_count(file.size, self.cfg.chunk_size);
            if count == 0 {
                // Nothing to fetch; an empty file still has to exist.
                File::create(&target).await?;
                stats.files += 1;
                continue;
            }

            let mut batched = false;
            for chunk_no in 0..count {
                self.cancel.check()?;
                self.set_state(TransferState::Transferring {
                    file: file.path.clone(),
                    chunk: chunk_no,
                    of: count,
                });

                let response = self
                    .fetch_chunk(full_name, &file.path, version, chunk_no)
                    .await?;
                let content_type = response.content_type().unwrap_or("").to_string();

                if content_type.starts_with("multipart/") {
                    let (written, bytes) = self
                        .unpack_batch(response, &content_type, project_dir)
                        .await?;
                    stats.files += written.len();
                    stats.bytes += bytes;
                    satisfied.extend(written);
                    // The batch is the server's full answer for this file.
                    batched = true;
                    break;
                }

                let bytes = response.read_body().await.map_err(SyncError::Transport)?;
                write_chunk(&target, chunk_no, &bytes).await?;
                stats.bytes += bytes.len() as u64;
            }
            if !batched {
                stats.files += 1;
            }
        }
        Ok(stats)
    }

    async fn fetch_chunk(
        &self,
        full_name: &str,
        file_path: &str,
        version: &str,
        chunk_no: usize,
    ) -> Result<ApiResponse> {
        let mut attempt = 1u32;
        loop {
            match self
                .fetch_chunk_once(full_name, file_path, version, chunk_no)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.cfg.retry_limit => {
                    warn!(file = file_path, chunk = chunk_no, attempt, %err, "chunk fetch failed, retrying");
                    self.set_state(TransferState::Retrying {
                        file: file_path.to_string(),
                        chunk: chunk_no,
                        attempt,
                    });
                    tokio::time::sleep(retry::delay_for_attempt(self.cfg.retry_base_delay, attempt))
                        .await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_chunk_once(
        &self,
        full_name: &str,
        file_path: &str,
        version: &str,
        chunk_no: usize,
    ) -> Result<ApiResponse> {
        let token = self.auth.token(self.transport, self.cfg).await?;
        let url = api::urls::download_chunk(self.cfg, full_name, file_path, version, chunk_no);
        let request = ApiRequest::get(&url)
            .bearer(&token)
            .header("Range", chunker::range_header(chunk_no, self.cfg.chunk_size));
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(SyncError::Transport)?;
        if response.is_success() {
            Ok(response)
        } else {
            let status = response.status;
            let body = response.read_body().await.map_err(SyncError::Transport)?;
            Err(SyncError::Server {
                status,
                url,
                message: api::extract_server_error(&body),
            })
        }
    }

    async fn unpack_batch(
        &self,
        response: ApiResponse,
        content_type: &str,
        project_dir: &Path,
    ) -> Result<(Vec<String>, u64)> {
        let mut parser = MultipartStreamParser::from_content_type(content_type, project_dir, false)?;
        let mut body = response.body;
        let mut buf = vec![0u8; IO_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = body.read(&mut buf).await.map_err(SyncError::Transport)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            parser.feed(&buf[..n])?;
        }
        Ok((parser.finish()?, total))
    }

    /// Negotiates and performs a push. Entries that ship content get their
    /// transfer chunk IDs assigned here; `removed` entries travel in the
    /// manifest only. Returns the server's view of the new version, which
    /// the caller stamps into the project metadata.
    ///
    /// Any failure after the transaction opened tells the server to drop
    /// it, so a half-done push does not hold the project locked until the
    /// server-side timeout.
    pub async fn upload(
        &self,
        full_name: &str,
        project_dir: &Path,
        version: &str,
        mut changes: ChangeSet,
    ) -> Result<(ProjectInfoResponse, TransferStats)> {
        self.set_state(TransferState::Planning);
        for entry in changes
            .added
            .iter_mut()
            .chain(changes.updated.iter_mut())
            .chain(changes.renamed.iter_mut())
        {
            entry.chunks = chunker::chunk_ids(entry.size, self.cfg.chunk_size);
        }

        let result = self
            .upload_inner(full_name, project_dir, version, &changes)
            .await;
        match &result {
            Ok((_, stats)) => {
                debug!(project = full_name, files = stats.files, bytes = stats.bytes, "upload done");
                self.set_state(TransferState::Done);
            }
            Err(err) => self.set_state(TransferState::Failed(err.to_string())),
        }
        result
    }

    async fn upload_inner(
        &self,
        full_name: &str,
        project_dir: &Path,
        version: &str,
        changes: &ChangeSet,
    ) -> Result<(ProjectInfoResponse, TransferStats)> {
        self.cancel.check()?;
        let transaction = self.push_start(full_name, version, changes).await?;

        match self.push_chunks_and_finish(&transaction, project_dir, changes).await {
            Ok(done) => Ok(done),
            Err(err) => {
                self.push_cancel(&transaction).await;
                Err(err)
            }
        }
    }

    async fn push_start(
        &self,
        full_name: &str,
        version: &str,
        changes: &ChangeSet,
    ) -> Result<String> {
        let token = self.auth.token(self.transport, self.cfg).await?;
        let url = api::urls::push_start(self.cfg, full_name);
        let payload = serde_json::to_vec(&PushStartRequest { changes, version })?;
        let request = ApiRequest::post(&url).bearer(&token).json_body(payload);
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status;
        let body = response.read_body().await.map_err(SyncError::Transport)?;
        if !(200..300).contains(&status) {
            return Err(SyncError::Server {
                status,
                url,
                message: api::extract_server_error(&body),
            });
        }
        let start: PushStartResponse = serde_json::from_slice(&body)?;
        if start.transaction.is_empty() {
            return Err(SyncError::Parse("push negotiation returned no transaction".into()));
        }
        Ok(start.transaction)
    }

    async fn push_chunks_and_finish(
        &self,
        transaction: &str,
        project_dir: &Path,
        changes: &ChangeSet,
    ) -> Result<(ProjectInfoResponse, TransferStats)> {
        let mut stats = TransferStats::default();
        for entry in changes.files_to_upload() {
            let source = safe_join(project_dir, &entry.path)?;
            let count = entry.chunks.len();
            for (chunk_no, chunk_id) in entry.chunks.iter().enumerate() {
                self.cancel.check()?;
                self.set_state(TransferState::Transferring {
                    file: entry.path.clone(),
                    chunk: chunk_no,
                    of: count,
                });
                let bytes = read_chunk(&source, chunk_no, self.cfg.chunk_size).await?;
                self.send_chunk(transaction, chunk_id, &entry.path, chunk_no, &bytes)
                    .await?;
                stats.bytes += bytes.len() as u64;
            }
            stats.files += 1;
        }
        let info = self.push_finish(transaction).await?;
        Ok((info, stats))
    }

    async fn send_chunk(
        &self,
        transaction: &str,
        chunk_id: &str,
        file_path: &str,
        chunk_no: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.send_chunk_once(transaction, chunk_id, bytes).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.cfg.retry_limit => {
                    warn!(file = file_path, chunk = chunk_no, attempt, %err, "chunk upload failed, retrying");
                    self.set_state(TransferState::Retrying {
                        file: file_path.to_string(),
                        chunk: chunk_no,
                        attempt,
                    });
                    tokio::time::sleep(retry::delay_for_attempt(self.cfg.retry_base_delay, attempt))
                        .await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_chunk_once(&self, transaction: &str, chunk_id: &str, bytes: &[u8]) -> Result<()> {
        let token = self.auth.token(self.transport, self.cfg).await?;
        let url = api::urls::push_chunk(self.cfg, transaction, chunk_id);
        let request = ApiRequest::post(&url)
            .bearer(&token)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec());
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(SyncError::Transport)?;
        if response.is_success() {
            Ok(())
        } else {
            let status = response.status;
            let body = response.read_body().await.map_err(SyncError::Transport)?;
            Err(SyncError::Server {
                status,
                url,
                message: api::extract_server_error(&body),
            })
        }
    }

    async fn push_finish(&self, transaction: &str) -> Result<ProjectInfoResponse> {
        let token = self.auth.token(self.transport, self.cfg).await?;
        let url = api::urls::push_finish(self.cfg, transaction);
        let request = ApiRequest::post(&url).bearer(&token);
        let response = self
            .transport
            .execute(request)
            .await
            .map_err(SyncError::Transport)?;
        let status = response.status;
        let body = response.read_body().await.map_err(SyncError::Transport)?;
        if !(200..300).contains(&status) {
            return Err(SyncError::Server {
                status,
                url,
                message: api::extract_server_error(&body),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Best effort; a failure here only means the transaction lives until
    /// the server times it out.
    async fn push_cancel(&self, transaction: &str) {
        let token = match self.auth.token(self.transport, self.cfg).await {
            Ok(token) => token,
            Err(_) => return,
        };
        let url = api::urls::push_cancel(self.cfg, transaction);
        let request = ApiRequest::post(&url).bearer(&token);
        match self.transport.execute(request).await {
            Ok(_) => debug!(transaction, "push transaction dropped"),
            Err(err) => warn!(transaction, %err, "push cancel did not reach the server"),
        }
    }
}

/// Chunk zero truncates whatever was there; later chunks append. Each
/// chunk closes the file again, so an interrupted download never holds
/// an open handle.
async fn write_chunk(target: &Path, chunk_no: usize, bytes: &[u8]) -> Result<()> {
    let mut file = if chunk_no == 0 {
        File::create(target).await?
    } else {
        OpenOptions::new().append(true).create(true).open(target).await?
    };
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Reads chunk `chunk_no` of `path`, up to `chunk_size` bytes from offset
/// `chunk_no * chunk_size`. The final chunk is short.
async fn read_chunk(path: &Path, chunk_no: usize, chunk_size: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(chunk_no as u64 * chunk_size)).await?;
    let mut buf = vec![0u8; chunk_size as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
