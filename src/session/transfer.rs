//! Peer file transfer
//!
//! An offer goes out as a request the server relays to the recipient, and
//! the call resolves once they answer with /accept or /reject. Accepted files
//! move over their own chunk channel. Every transfer runs as a background
//! task so the chat keeps flowing meanwhile.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{SessionConfig, TransferConfig};
use crate::console::Console;
use crate::error::TransferError;
use crate::protocol::{transfer_metadata, FileChunk, FileTransferRequest, SessionIdentity, TransferRole};
use crate::transport::{Inbound, Outbound, Transport};

/// How an offer we made ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { bytes: u64 },
    Declined,
}

/// A file we accepted and stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub path: PathBuf,
    pub bytes: u64,
}

/// File offers made to us and transfers in flight for one chat session
pub struct FileTransfers {
    identity: SessionIdentity,
    transport: Arc<dyn Transport>,
    console: Arc<dyn Console>,
    config: TransferConfig,
    /// How long a finished sender waits for the server to close its channel
    close_grace: Duration,
    /// How long shutdown waits for background transfers
    join_timeout: Duration,
    pending: Mutex<Vec<FileTransferRequest>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl FileTransfers {
    pub fn new(
        identity: SessionIdentity,
        transport: Arc<dyn Transport>,
        console: Arc<dyn Console>,
        config: TransferConfig,
        session: &SessionConfig,
    ) -> Self {
        Self {
            identity,
            transport,
            console,
            config,
            close_grace: session.outbound_grace(),
            join_timeout: session.receiver_join_timeout(),
            pending: Mutex::new(Vec::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Offers waiting for /accept or /reject, oldest first
    pub fn pending_offers(&self) -> Vec<FileTransferRequest> {
        self.pending.lock().clone()
    }

    /// Record an offer announced on the chat channel
    pub fn offer_received(self: &Arc<Self>, offer: FileTransferRequest) {
        if offer.sender == self.identity.sender() {
            return;
        }

        let queued = {
            let mut pending = self.pending.lock();
            if pending.iter().any(|o| o.transfer_id == offer.transfer_id) {
                return;
            }
            if pending.len() < self.config.max_pending_offers {
                pending.push(offer.clone());
                true
            } else {
                false
            }
        };

        if !queued {
            warn!("Too many pending file offers, declining {}", offer.transfer_id);
            self.console.notice(&format!(
                "Too many pending file offers; declined '{}' from {}.",
                offer.filename, offer.sender
            ));
            let transport = self.transport.clone();
            self.spawn("file reject", async move {
                transport.respond_file_transfer(offer.answer(false)).await?;
                Ok(())
            });
            return;
        }

        info!("File offer {} from {}: {}", offer.transfer_id, offer.sender, offer.filename);
        let id = short_id(&offer.transfer_id);
        self.console.notice(&format!(
            "{} wants to send you '{}' ({:.2} MB). Type /accept {} [destination] or /reject {}.",
            offer.sender,
            offer.filename,
            offer.file_size as f64 / (1024.0 * 1024.0),
            id,
            id
        ));
    }

    /// Offer `path` to `recipient` and send it if they accept
    pub async fn send_file(&self, recipient: &str, path: &Path) -> Result<SendOutcome, TransferError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::io(path.display(), e))?;
        if !meta.is_file() {
            return Err(TransferError::NotAFile(path.display().to_string()));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::NotAFile(path.display().to_string()))?;

        let request = FileTransferRequest::new(&self.identity, recipient, &filename, meta.len());
        self.console.notice(&format!("Offering '{}' to {}...", filename, recipient));

        let answer = tokio::time::timeout(
            self.config.answer_timeout(),
            self.transport.request_file_transfer(request.clone()),
        )
        .await
        .map_err(|_| TransferError::NoAnswer(recipient.to_string()))??;

        if !answer.accepted {
            info!("{} declined transfer {}", recipient, request.transfer_id);
            self.console.notice(&format!("{} declined '{}'.", recipient, filename));
            return Ok(SendOutcome::Declined);
        }
        self.console.notice(&format!("{} accepted '{}'. Sending...", recipient, filename));

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::io(path.display(), e))?;
        let (done_tx, mut done_rx) = oneshot::channel();
        let progress = Progress::new(self.console.clone(), format!("Sending '{}'", filename), meta.len());
        let chunks = file_chunks(file, request.transfer_id.clone(), self.config.chunk_size, progress, done_tx);

        let mut channel = self
            .transport
            .open_file_transfer(chunks, transfer_metadata(TransferRole::Sender, &request.transfer_id))
            .await?;

        let sent = loop {
            tokio::select! {
                done = &mut done_rx => break done.unwrap_or(Err(TransferError::Incomplete)),
                item = channel.inbound.next() => match item {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        channel.cancel();
                        return Err(e.into());
                    }
                    None => {
                        let done = tokio::time::timeout(self.close_grace, &mut done_rx).await;
                        break done.ok().and_then(Result::ok).unwrap_or(Err(TransferError::Incomplete));
                    }
                },
            }
        };

        let bytes = match sent {
            Ok(bytes) => bytes,
            Err(e) => {
                channel.cancel();
                return Err(e);
            }
        };

        // Let the server acknowledge the last chunk before tearing down
        let drained = tokio::time::timeout(self.close_grace, drain(&mut channel.inbound)).await;
        if drained.is_err() {
            debug!("Server kept transfer {} open, cancelling", request.transfer_id);
        }
        channel.cancel();

        info!("Sent {} ({} bytes) to {}", filename, bytes, recipient);
        self.console.notice(&format!("Sent '{}' to {} ({} bytes).", filename, recipient, bytes));
        Ok(SendOutcome::Sent { bytes })
    }

    /// Accept a pending offer and store the file
    ///
    /// `offer` is a transfer id or a unique prefix of one; `None` picks the
    /// oldest offer. `destination` is a directory or a file path; `None`
    /// means the configured download directory.
    pub async fn accept(&self, offer: Option<&str>, destination: Option<&str>) -> Result<Received, TransferError> {
        let offer = self.take_offer(offer)?;
        let path = self.destination(&offer, destination).await?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent.display(), e))?;
        }
        let mut partial = PartialFile::create(&path).await?;

        self.console.notice(&format!("Accepting '{}' from {}...", offer.filename, offer.sender));

        // Open before answering so no chunk can arrive ahead of us
        let mut channel = self
            .transport
            .open_file_transfer(
                stream::empty().boxed(),
                transfer_metadata(TransferRole::Receiver, &offer.transfer_id),
            )
            .await?;
        if let Err(e) = self.transport.respond_file_transfer(offer.answer(true)).await {
            channel.cancel();
            return Err(e.into());
        }

        let progress = Progress::new(
            self.console.clone(),
            format!("Receiving '{}'", offer.filename),
            offer.file_size,
        );
        let received = receive_chunks(&mut channel.inbound, &offer, &mut partial.file, &progress).await;
        channel.cancel();

        let bytes = received?;
        partial.finish().await?;

        info!("Received {} ({} bytes) from {}", offer.filename, bytes, offer.sender);
        self.console.notice(&format!(
            "Received '{}' from {}: {}",
            offer.filename,
            offer.sender,
            path.display()
        ));
        Ok(Received { path, bytes })
    }

    /// Decline a pending offer; `offer` selects it as in [`FileTransfers::accept`]
    pub async fn reject(&self, offer: Option<&str>) -> Result<(), TransferError> {
        let offer = self.take_offer(offer)?;
        self.transport.respond_file_transfer(offer.answer(false)).await?;

        info!("Declined transfer {}", offer.transfer_id);
        self.console.notice(&format!("Declined '{}' from {}.", offer.filename, offer.sender));
        Ok(())
    }

    /// [`FileTransfers::send_file`] in the background; `path` may start with `~`
    pub fn start_upload(self: &Arc<Self>, recipient: String, path: String) {
        let this = self.clone();
        self.spawn("file upload", async move {
            let path = PathBuf::from(shellexpand::tilde(&path).into_owned());
            this.send_file(&recipient, &path).await.map(drop)
        });
    }

    /// [`FileTransfers::accept`] in the background
    pub fn start_accept(self: &Arc<Self>, offer: Option<String>, destination: Option<String>) {
        let this = self.clone();
        self.spawn("file download", async move {
            this.accept(offer.as_deref(), destination.as_deref()).await.map(drop)
        });
    }

    /// [`FileTransfers::reject`] in the background
    pub fn start_reject(self: &Arc<Self>, offer: Option<String>) {
        let this = self.clone();
        self.spawn("file reject", async move { this.reject(offer.as_deref()).await });
    }

    /// Stop every background transfer. Waits at most the receiver join timeout.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(self.join_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!("File transfers did not stop within {:?}, aborting", self.join_timeout);
            tasks.abort_all();
        }
    }

    fn spawn<F>(&self, operation: &'static str, work: F)
    where
        F: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            debug!("Ignoring {} after shutdown", operation);
            return;
        }

        let console = self.console.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.lock().spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => debug!("{} interrupted by shutdown", operation),
                result = work => {
                    if let Err(e) = result {
                        warn!("{} failed: {}", operation, e);
                        console.report_error(operation, &e);
                    }
                }
            }
        });
    }

    fn take_offer(&self, selector: Option<&str>) -> Result<FileTransferRequest, TransferError> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Err(TransferError::NoPendingOffer);
        }

        let index = match selector {
            None => 0,
            Some(selector) => match pending.iter().position(|o| o.transfer_id == selector) {
                Some(index) => index,
                None => {
                    let mut matches = pending
                        .iter()
                        .enumerate()
                        .filter(|(_, o)| o.transfer_id.starts_with(selector))
                        .map(|(index, _)| index);
                    match (matches.next(), matches.next()) {
                        (Some(index), None) => index,
                        (None, _) => return Err(TransferError::UnknownOffer(selector.to_string())),
                        (Some(_), Some(_)) => return Err(TransferError::AmbiguousOffer(selector.to_string())),
                    }
                }
            },
        };

        Ok(pending.remove(index))
    }

    async fn destination(
        &self,
        offer: &FileTransferRequest,
        destination: Option<&str>,
    ) -> Result<PathBuf, TransferError> {
        // Only the final component of the offered name is trusted
        let filename = Path::new(&offer.filename)
            .file_name()
            .ok_or_else(|| TransferError::NotAFile(offer.filename.clone()))?;

        let Some(destination) = destination else {
            return Ok(self.config.download_dir().join(filename));
        };

        let destination = PathBuf::from(shellexpand::tilde(destination).into_owned());
        let is_dir = tokio::fs::metadata(&destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(if is_dir { destination.join(filename) } else { destination })
    }
}

/// First characters of a transfer id, enough to type in /accept or /reject
pub fn short_id(transfer_id: &str) -> &str {
    match transfer_id.char_indices().nth(8) {
        Some((end, _)) => &transfer_id[..end],
        None => transfer_id,
    }
}

/// Progress notices every ten chunks
struct Progress {
    console: Arc<dyn Console>,
    label: String,
    total: u64,
}

impl Progress {
    fn new(console: Arc<dyn Console>, label: String, total: u64) -> Self {
        Self { console, label, total }
    }

    fn report(&self, chunks: u32, bytes: u64) {
        if chunks % 10 == 0 && self.total > 0 {
            let percent = bytes as f64 / self.total as f64 * 100.0;
            self.console.notice(&format!("{}... {:.1}%", self.label, percent));
        }
    }
}

/// Lazy chunk sequence over `file`, ending with an empty `is_last` chunk
///
/// `done` gets the byte count once the last chunk was taken, or the read
/// error that cut the sequence short.
fn file_chunks(
    mut file: tokio::fs::File,
    transfer_id: String,
    chunk_size: usize,
    progress: Progress,
    done: oneshot::Sender<Result<u64, TransferError>>,
) -> Outbound<FileChunk> {
    let chunks = stream! {
        let mut buffer = vec![0u8; chunk_size.max(1)];
        let mut chunk_number = 0u32;
        let mut sent = 0u64;

        let outcome = loop {
            let read = match file.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => break Err(TransferError::io("read failed", e)),
            };

            if read == 0 {
                yield FileChunk {
                    transfer_id: transfer_id.clone(),
                    data: Vec::new(),
                    chunk_number,
                    is_last: true,
                };
                break Ok(sent);
            }

            yield FileChunk {
                transfer_id: transfer_id.clone(),
                data: buffer[..read].to_vec(),
                chunk_number,
                is_last: false,
            };
            chunk_number += 1;
            sent += read as u64;
            progress.report(chunk_number, sent);
        };

        let _ = done.send(outcome);
    };

    chunks.boxed()
}

async fn receive_chunks(
    inbound: &mut Inbound<FileChunk>,
    offer: &FileTransferRequest,
    file: &mut tokio::fs::File,
    progress: &Progress,
) -> Result<u64, TransferError> {
    let mut expected = 0u32;
    let mut bytes = 0u64;

    while let Some(item) = inbound.next().await {
        let chunk = item?;
        if chunk.transfer_id != offer.transfer_id {
            warn!("Ignoring chunk of transfer {} on {}", chunk.transfer_id, offer.transfer_id);
            continue;
        }
        if chunk.chunk_number != expected {
            return Err(TransferError::OutOfOrder {
                expected,
                got: chunk.chunk_number,
            });
        }
        expected += 1;

        if !chunk.data.is_empty() {
            file.write_all(&chunk.data)
                .await
                .map_err(|e| TransferError::io("write failed", e))?;
            bytes += chunk.data.len() as u64;
        }
        if chunk.is_last {
            return Ok(bytes);
        }
        progress.report(expected, bytes);
    }

    Err(TransferError::Incomplete)
}

async fn drain<T>(inbound: &mut Inbound<T>) {
    while inbound.next().await.is_some() {}
}

/// Download in progress: written to `<dest>.part`, renamed on success, removed otherwise
struct PartialFile {
    file: tokio::fs::File,
    part: PathBuf,
    dest: PathBuf,
    kept: bool,
}

impl PartialFile {
    async fn create(dest: &Path) -> Result<Self, TransferError> {
        let mut part = dest.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        let file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| TransferError::io(part.display(), e))?;

        Ok(Self {
            file,
            part,
            dest: dest.to_path_buf(),
            kept: false,
        })
    }

    async fn finish(mut self) -> Result<(), TransferError> {
        self.file
            .flush()
            .await
            .map_err(|e| TransferError::io(self.part.display(), e))?;
        tokio::fs::rename(&self.part, &self.dest)
            .await
            .map_err(|e| TransferError::io(self.dest.display(), e))?;
        self.kept = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.kept {
            if let Err(e) = std::fs::remove_file(&self.part) {
                debug!("Could not remove {}: {}", self.part.display(), e);
            }
        }
    }
}
