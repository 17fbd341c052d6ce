// In-memory doubles for session tests
//
// - `FakeServer`: a scripted chat/audio/file service implementing `Transport`
// - `FakeDevice`: an audio device whose opens and reads can be told to fail
// - `RecordingConsole`: collects everything the sessions report
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use loqa_rooms::audio::{AudioDevice, AudioFormat, FrameSink, FrameSource};
use loqa_rooms::protocol::{NAME_TAKEN_PREFIX, SERVER_SENDER};
use loqa_rooms::transport::{DuplexChannel, Inbound, Metadata, Outbound, Transport};
use loqa_rooms::{
    AudioFrame, AudioSession, ChatError, ChatMessage, Console, DeviceError, FileChunk, FileTransferRequest,
    FileTransferResponse, FileTransfers, InputEvent, NameSource, SessionConfig, SessionContext,
    SessionIdentity, TransferConfig, TransportError,
};

type Tx<T> = mpsc::UnboundedSender<Result<T, TransportError>>;

/// Inbound sequence fed by a channel; cancel ends it with `Cancelled`
fn inbound_from<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<Result<T, TransportError>>,
    cancel: CancellationToken,
) -> Inbound<T> {
    stream! {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                item = rx.recv() => Some(item),
            };
            match next {
                None => {
                    yield Err(TransportError::Cancelled);
                    break;
                }
                Some(None) => break,
                Some(Some(item)) => yield item,
            }
        }
    }
    .boxed()
}

fn server_message(text: String, room_id: &str) -> ChatMessage {
    ChatMessage {
        sender: SERVER_SENDER.to_string(),
        message: text,
        room_id: room_id.to_string(),
        timestamp: 1_700_000_000,
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// A file the server pushes to whoever accepts its offer
#[derive(Clone)]
struct OfferedFile {
    data: Vec<u8>,
    chunk_size: usize,
    mode: ServeMode,
}

/// How an offered file is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    Complete,
    /// Closes the channel before the last chunk
    Truncated,
    /// Sends the second chunk before the first
    Swapped,
}

fn metadata_value<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

#[derive(Default)]
struct ServerState {
    taken: Mutex<HashSet<String>>,
    reject_all: AtomicBool,
    no_echo: AtomicBool,
    join_attempts: Mutex<Vec<ChatMessage>>,
    chat_log: Mutex<Vec<ChatMessage>>,
    chat_clients: Mutex<Vec<(String, Tx<ChatMessage>)>>,
    fail_audio_open: AtomicBool,
    next_audio_id: AtomicUsize,
    audio_clients: Mutex<Vec<(usize, Tx<AudioFrame>)>>,
    audio_metadata: Mutex<Vec<Metadata>>,
    audio_frames: AtomicUsize,
    audio_open: AtomicUsize,
    audio_opened_total: AtomicUsize,
    stall_audio: AtomicBool,
    /// Senders of stalled audio channels; never dropped
    stalled_audio: Mutex<Vec<Tx<AudioFrame>>>,
    transfer_requests: Mutex<Vec<FileTransferRequest>>,
    transfer_responses: Mutex<Vec<FileTransferResponse>>,
    /// `None` relays offers to the recipient and waits for their answer
    auto_answer: Mutex<Option<bool>>,
    awaiting_answer: Mutex<HashMap<String, oneshot::Sender<FileTransferResponse>>>,
    offered_files: Mutex<HashMap<String, OfferedFile>>,
    /// Receiver channels waiting for a peer's upload
    receivers: Mutex<HashMap<String, Tx<FileChunk>>>,
    uploads: Mutex<HashMap<String, Vec<FileChunk>>>,
    transfer_metadata: Mutex<Vec<Metadata>>,
}

impl ServerState {
    fn broadcast(&self, msg: &ChatMessage) {
        for (_, tx) in self.chat_clients.lock().iter() {
            let _ = tx.send(Ok(msg.clone()));
        }
    }

    fn send_to(&self, name: &str, msg: &ChatMessage) {
        for (_, tx) in self.chat_clients.lock().iter().filter(|(n, _)| n == name) {
            let _ = tx.send(Ok(msg.clone()));
        }
    }
}

/// Chunks of `file` in the order `file.mode` asks for
fn serve_chunks(transfer_id: &str, file: &OfferedFile) -> Vec<FileChunk> {
    let mut chunks: Vec<FileChunk> = file
        .data
        .chunks(file.chunk_size)
        .enumerate()
        .map(|(i, data)| FileChunk {
            transfer_id: transfer_id.to_string(),
            data: data.to_vec(),
            chunk_number: i as u32,
            is_last: false,
        })
        .collect();
    chunks.push(FileChunk {
        transfer_id: transfer_id.to_string(),
        data: Vec::new(),
        chunk_number: chunks.len() as u32,
        is_last: true,
    });

    match file.mode {
        ServeMode::Complete => {}
        ServeMode::Truncated => {
            chunks.pop();
        }
        ServeMode::Swapped => {
            if chunks.len() > 1 {
                chunks.swap(0, 1);
            }
        }
    }
    chunks
}

/// Scripted chat service: rejects taken names, broadcasts everything to everyone
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend someone already uses `name`
    pub fn take_name(&self, name: &str) {
        self.state.taken.lock().insert(name.to_string());
    }

    pub fn reject_all_names(&self) {
        self.state.reject_all.store(true, Ordering::SeqCst);
    }

    /// Stop broadcasting client messages back to their senders
    pub fn disable_echo(&self) {
        self.state.no_echo.store(true, Ordering::SeqCst);
    }

    pub fn fail_audio_open(&self, fail: bool) {
        self.state.fail_audio_open.store(fail, Ordering::SeqCst);
    }

    /// First message seen on every chat channel
    pub fn join_attempts(&self) -> Vec<ChatMessage> {
        self.state.join_attempts.lock().clone()
    }

    /// Every message received on any chat channel
    pub fn chat_log(&self) -> Vec<ChatMessage> {
        self.state.chat_log.lock().clone()
    }

    pub fn chat_texts_from(&self, sender: &str) -> Vec<String> {
        self.chat_log()
            .into_iter()
            .filter(|m| m.sender == sender)
            .map(|m| m.message)
            .collect()
    }

    /// Another participant speaks
    pub fn say(&self, sender: &str, text: &str) {
        let msg = ChatMessage {
            sender: sender.to_string(),
            message: text.to_string(),
            room_id: "r1".to_string(),
            timestamp: 1_700_000_000,
            trace_id: uuid::Uuid::new_v4().to_string(),
        };
        self.state.broadcast(&msg);
    }

    /// Fail every chat channel with `err`
    pub fn fail_chat(&self, err: TransportError) {
        for (_, tx) in self.state.chat_clients.lock().drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Close every chat channel from the server side
    pub fn close_chat(&self) {
        self.state.chat_clients.lock().clear();
    }

    pub fn chat_clients(&self) -> usize {
        self.state.chat_clients.lock().len()
    }

    pub fn send_audio(&self, frame: AudioFrame) {
        for (_, tx) in self.state.audio_clients.lock().iter() {
            let _ = tx.send(Ok(frame.clone()));
        }
    }

    pub fn fail_audio(&self, err: TransportError) {
        for (_, tx) in self.state.audio_clients.lock().drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub fn close_audio(&self) {
        self.state.audio_clients.lock().clear();
    }

    pub fn audio_metadata(&self) -> Vec<Metadata> {
        self.state.audio_metadata.lock().clone()
    }

    pub fn audio_frames_received(&self) -> usize {
        self.state.audio_frames.load(Ordering::SeqCst)
    }

    /// Audio channels whose send side is still open
    pub fn audio_channels_open(&self) -> usize {
        self.state.audio_open.load(Ordering::SeqCst)
    }

    pub fn audio_channels_opened(&self) -> usize {
        self.state.audio_opened_total.load(Ordering::SeqCst)
    }

    /// New audio channels ignore cancellation and never end their inbound side
    pub fn stall_audio_receivers(&self) {
        self.state.stall_audio.store(true, Ordering::SeqCst);
    }

    /// Answer every file offer at once instead of relaying it to the recipient
    pub fn auto_answer_transfers(&self, accepted: bool) {
        *self.state.auto_answer.lock() = Some(accepted);
    }

    /// `from` offers a file to `to`; the server serves it in 4-byte chunks once accepted
    pub fn offer_file(
        &self,
        from: &str,
        to: &str,
        filename: &str,
        data: &[u8],
        mode: ServeMode,
    ) -> FileTransferRequest {
        let transfer_id = uuid::Uuid::new_v4().to_string();
        let request = FileTransferRequest {
            transfer_id: transfer_id.clone(),
            sender: from.to_string(),
            recipient: to.to_string(),
            room_id: "r1".to_string(),
            filename: filename.to_string(),
            file_size: data.len() as u64,
            timestamp: 1_700_000_000,
        };
        self.state.offered_files.lock().insert(
            transfer_id.clone(),
            OfferedFile {
                data: data.to_vec(),
                chunk_size: 4,
                mode,
            },
        );
        self.state.send_to(to, &request.announcement());
        request
    }

    pub fn transfer_requests(&self) -> Vec<FileTransferRequest> {
        self.state.transfer_requests.lock().clone()
    }

    pub fn transfer_responses(&self) -> Vec<FileTransferResponse> {
        self.state.transfer_responses.lock().clone()
    }

    /// Chunks received from the sending side of `transfer_id`
    pub fn uploaded_chunks(&self, transfer_id: &str) -> Vec<FileChunk> {
        self.state.uploads.lock().get(transfer_id).cloned().unwrap_or_default()
    }

    pub fn uploaded_bytes(&self, transfer_id: &str) -> Vec<u8> {
        self.uploaded_chunks(transfer_id)
            .into_iter()
            .flat_map(|c| c.data)
            .collect()
    }

    pub fn transfer_channel_metadata(&self) -> Vec<Metadata> {
        self.state.transfer_metadata.lock().clone()
    }
}

#[async_trait::async_trait]
impl Transport for FakeServer {
    async fn open_chat(
        &self,
        mut outbound: Outbound<ChatMessage>,
        _metadata: Metadata,
    ) -> Result<DuplexChannel<ChatMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let state = self.state.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut first = true;
            let mut accepted: Option<String> = None;
            // Once accepted, the only sender lives in `chat_clients`
            let mut reply = Some(tx);

            loop {
                let item = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    item = outbound.next() => item,
                };
                let Some(msg) = item else { break };
                state.chat_log.lock().push(msg.clone());

                if first {
                    first = false;
                    state.join_attempts.lock().push(msg.clone());

                    let rejected = state.reject_all.load(Ordering::SeqCst)
                        || !state.taken.lock().insert(msg.sender.clone());
                    if rejected {
                        let text = format!("{}{} unavailable", NAME_TAKEN_PREFIX, msg.sender);
                        if let Some(tx) = &reply {
                            let _ = tx.send(Ok(server_message(text, &msg.room_id)));
                        }
                        continue;
                    }

                    accepted = Some(msg.sender.clone());
                    if let Some(tx) = reply.take() {
                        state.chat_clients.lock().push((msg.sender.clone(), tx));
                    }
                    state.broadcast(&server_message(
                        format!("{} joined the room.", msg.sender),
                        &msg.room_id,
                    ));
                    continue;
                }

                if accepted.is_some() && !state.no_echo.load(Ordering::SeqCst) {
                    state.broadcast(&msg);
                }
            }

            if let Some(name) = accepted {
                state.chat_clients.lock().retain(|(n, _)| *n != name);
                state.taken.lock().remove(&name);
            }
        });

        Ok(DuplexChannel::new(inbound_from(rx, cancel.clone()), cancel))
    }

    async fn open_audio(
        &self,
        mut outbound: Outbound<AudioFrame>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<AudioFrame>, TransportError> {
        if self.state.fail_audio_open.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("audio service down".to_string()));
        }

        let id = self.state.next_audio_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inbound = if self.state.stall_audio.load(Ordering::SeqCst) {
            self.state.stalled_audio.lock().push(tx.clone());
            inbound_from(rx, CancellationToken::new())
        } else {
            inbound_from(rx, cancel.clone())
        };

        self.state.audio_metadata.lock().push(metadata);
        self.state.audio_clients.lock().push((id, tx));
        self.state.audio_open.fetch_add(1, Ordering::SeqCst);
        self.state.audio_opened_total.fetch_add(1, Ordering::SeqCst);

        let state = self.state.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    item = outbound.next() => item,
                };
                match item {
                    Some(_frame) => {
                        state.audio_frames.fetch_add(1, Ordering::SeqCst);
                    }
                    None => break,
                }
            }
            state.audio_open.fetch_sub(1, Ordering::SeqCst);
            state.audio_clients.lock().retain(|(client, _)| *client != id);
        });

        Ok(DuplexChannel::new(inbound, cancel))
    }

    async fn request_file_transfer(
        &self,
        request: FileTransferRequest,
    ) -> Result<FileTransferResponse, TransportError> {
        self.state.transfer_requests.lock().push(request.clone());

        let auto_answer = *self.state.auto_answer.lock();
        if let Some(accepted) = auto_answer {
            return Ok(request.answer(accepted));
        }

        let (tx, rx) = oneshot::channel();
        self.state
            .awaiting_answer
            .lock()
            .insert(request.transfer_id.clone(), tx);
        self.state.send_to(&request.recipient, &request.announcement());

        rx.await
            .map_err(|_| TransportError::Unavailable("offer dropped".to_string()))
    }

    async fn respond_file_transfer(&self, response: FileTransferResponse) -> Result<(), TransportError> {
        self.state.transfer_responses.lock().push(response.clone());
        let waiting = self.state.awaiting_answer.lock().remove(&response.transfer_id);
        if let Some(tx) = waiting {
            let _ = tx.send(response);
        }
        Ok(())
    }

    async fn open_file_transfer(
        &self,
        mut outbound: Outbound<FileChunk>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<FileChunk>, TransportError> {
        let transfer_id = metadata_value(&metadata, "transfer-id")
            .ok_or_else(|| TransportError::Other("missing transfer id".to_string()))?
            .to_string();
        let role = metadata_value(&metadata, "role").unwrap_or_default().to_string();
        self.state.transfer_metadata.lock().push(metadata);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        if role == "receiver" {
            let offered = self.state.offered_files.lock().get(&transfer_id).cloned();
            match offered {
                Some(file) => {
                    for chunk in serve_chunks(&transfer_id, &file) {
                        let _ = tx.send(Ok(chunk));
                    }
                }
                None => {
                    self.state.receivers.lock().insert(transfer_id, tx);
                }
            }
            return Ok(DuplexChannel::new(inbound_from(rx, cancel.clone()), cancel));
        }

        let state = self.state.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            // Dropping `tx` once the upload ends closes the sender's inbound side
            let _tx = tx;
            loop {
                let item = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    item = outbound.next() => item,
                };
                let Some(chunk) = item else { break };
                let last = chunk.is_last;

                state
                    .uploads
                    .lock()
                    .entry(transfer_id.clone())
                    .or_default()
                    .push(chunk.clone());
                if let Some(peer) = state.receivers.lock().get(&transfer_id) {
                    let _ = peer.send(Ok(chunk));
                }
                if last {
                    state.receivers.lock().remove(&transfer_id);
                }
            }
        });

        Ok(DuplexChannel::new(inbound_from(rx, cancel.clone()), cancel))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Audio device producing a constant frame every few milliseconds
#[derive(Default)]
pub struct FakeDevice {
    capture_open_fails: AtomicBool,
    playback_open_fails: AtomicBool,
    capture_read_fails: Arc<AtomicBool>,
    playback_write_fails: Arc<AtomicBool>,
    captures_opened: AtomicUsize,
    playbacks_opened: AtomicUsize,
    played: Arc<Mutex<Vec<AudioFrame>>>,
    terminated: AtomicBool,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_capture_open(&self, fail: bool) {
        self.capture_open_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_playback_open(&self, fail: bool) {
        self.playback_open_fails.store(fail, Ordering::SeqCst);
    }

    /// Make open capture streams fail on their next read
    pub fn fail_capture_reads(&self) {
        self.capture_read_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_playback_writes(&self) {
        self.playback_write_fails.store(true, Ordering::SeqCst);
    }

    pub fn captures_opened(&self) -> usize {
        self.captures_opened.load(Ordering::SeqCst)
    }

    pub fn playbacks_opened(&self) -> usize {
        self.playbacks_opened.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<AudioFrame> {
        self.played.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

struct FakeCapture {
    frame: AudioFrame,
    fails: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl FrameSource for FakeCapture {
    async fn read_frame(&mut self) -> Result<AudioFrame, DeviceError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        if self.fails.load(Ordering::SeqCst) {
            return Err(DeviceError::IoFailure("microphone unplugged".to_string()));
        }
        Ok(self.frame.clone())
    }
}

struct FakePlayback {
    played: Arc<Mutex<Vec<AudioFrame>>>,
    fails: Arc<AtomicBool>,
}

impl FrameSink for FakePlayback {
    fn write_frame(&mut self, frame: &AudioFrame) -> Result<(), DeviceError> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(DeviceError::IoFailure("speakers unplugged".to_string()));
        }
        self.played.lock().push(frame.clone());
        Ok(())
    }
}

impl AudioDevice for FakeDevice {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn FrameSource>, DeviceError> {
        if self.terminated.load(Ordering::SeqCst) || self.capture_open_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::OpenFailed("no input device".to_string()));
        }
        self.captures_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            frame: AudioFrame::new(vec![1; format.bytes_per_frame()]),
            fails: self.capture_read_fails.clone(),
        }))
    }

    fn open_playback(&self, _format: &AudioFormat) -> Result<Box<dyn FrameSink>, DeviceError> {
        if self.terminated.load(Ordering::SeqCst) || self.playback_open_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::OpenFailed("no output device".to_string()));
        }
        self.playbacks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePlayback {
            played: self.played.clone(),
            fails: self.playback_write_fails.clone(),
        }))
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Console that remembers what it was told
#[derive(Default)]
pub struct RecordingConsole {
    messages: Mutex<Vec<ChatMessage>>,
    notices: Mutex<Vec<String>>,
    errors: Mutex<Vec<(String, String)>>,
}

impl RecordingConsole {
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }

    pub fn has_notice(&self, needle: &str) -> bool {
        self.notices.lock().iter().any(|n| n.contains(needle))
    }

    /// `(operation, message)` pairs
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().clone()
    }

    pub fn has_error(&self, operation: &str) -> bool {
        self.errors.lock().iter().any(|(op, _)| op == operation)
    }
}

impl Console for RecordingConsole {
    fn show_message(&self, msg: &ChatMessage) {
        self.messages.lock().push(msg.clone());
    }

    fn notice(&self, text: &str) {
        self.notices.lock().push(text.to_string());
    }

    fn report_error(&self, operation: &str, err: &dyn std::error::Error) {
        self.errors.lock().push((operation.to_string(), err.to_string()));
    }
}

/// Names handed out in order; records the rejection reasons it was given
pub struct ScriptedNames {
    names: VecDeque<String>,
    /// Once the script runs out, read names from the input channel
    typed: bool,
    pub rejections: Vec<Option<String>>,
}

impl ScriptedNames {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            typed: false,
            rejections: Vec::new(),
        }
    }

    /// `names` first, then whatever the user types
    pub fn then_typed(names: &[&str]) -> Self {
        Self {
            typed: true,
            ..Self::new(names)
        }
    }
}

#[async_trait::async_trait]
impl NameSource for ScriptedNames {
    async fn next_name(
        &mut self,
        rejection: Option<&str>,
        input: &mut mpsc::Receiver<InputEvent>,
    ) -> Result<String, ChatError> {
        self.rejections.push(rejection.map(str::to_string));
        if let Some(name) = self.names.pop_front() {
            return Ok(name);
        }
        if self.typed {
            if let Some(InputEvent::Line(line)) = input.recv().await {
                return Ok(line);
            }
        }
        Err(ChatError::JoinAborted("out of names".to_string()))
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        max_join_attempts: 5,
        receiver_join_timeout_ms: 200,
        outbound_grace_ms: 100,
    }
}

/// Transfer tuning with downloads under `dir` and a short answer wait
pub fn test_transfer_config(dir: &TempDir) -> TransferConfig {
    TransferConfig {
        download_dir: dir.path().join("downloads").display().to_string(),
        chunk_size: 8,
        answer_timeout_ms: 500,
        max_pending_offers: 3,
    }
}

pub fn test_format() -> AudioFormat {
    AudioFormat {
        frame_size: 64,
        ..AudioFormat::default()
    }
}

/// Fake server, device and console wired into a session context
pub struct Harness {
    pub server: FakeServer,
    pub device: Arc<FakeDevice>,
    pub console: Arc<RecordingConsole>,
    pub ctx: SessionContext,
    /// Holds the download directory for the harness lifetime
    pub files: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let server = FakeServer::new();
        let device = Arc::new(FakeDevice::new());
        let console = Arc::new(RecordingConsole::default());
        let files = TempDir::new().expect("temp dir");

        let ctx = SessionContext {
            transport: Arc::new(server.clone()),
            device: device.clone(),
            console: console.clone(),
            format: test_format(),
            config: test_config(),
            transfer: test_transfer_config(&files),
        };

        Self {
            server,
            device,
            console,
            ctx,
            files,
        }
    }

    /// File transfers for `sender` in room r1, outside any chat session
    pub fn transfers(&self, sender: &str) -> Arc<FileTransfers> {
        Arc::new(FileTransfers::new(
            SessionIdentity::new(sender, "r1"),
            self.ctx.transport.clone(),
            self.ctx.console.clone(),
            self.ctx.transfer.clone(),
            &self.ctx.config,
        ))
    }

    /// Where accepted files land by default
    pub fn download_dir(&self) -> std::path::PathBuf {
        self.ctx.transfer.download_dir()
    }

    /// A standalone audio session for `sender` in room r1
    pub fn audio_session(&self, sender: &str) -> AudioSession {
        AudioSession::new(
            SessionIdentity::new(sender, "r1"),
            self.ctx.transport.clone(),
            self.ctx.device.clone(),
            self.ctx.console.clone(),
            self.ctx.format.clone(),
            self.ctx.config.clone(),
        )
    }
}

/// Poll `cond` until it holds or two seconds pass
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
