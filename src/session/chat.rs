use std::sync::Arc;

use async_stream::stream;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::audio::AudioSession;
use super::commands::{parse_input, Command, Input};
use super::config::{SessionConfig, TransferConfig};
use super::state::ChatSessionState;
use super::transfer::FileTransfers;
use crate::audio::{AudioDevice, AudioFormat};
use crate::console::{help_text, Console, InputEvent};
use crate::error::{ChatError, TransportError};
use crate::protocol::{parse_file_request, ChatMessage, SessionIdentity};
use crate::transport::{DuplexChannel, Inbound, Outbound, Transport};

/// Collaborators shared by every session attempt
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub device: Arc<dyn AudioDevice>,
    pub console: Arc<dyn Console>,
    pub format: AudioFormat,
    pub config: SessionConfig,
    pub transfer: TransferConfig,
}

/// The half of a chat session the outbound sequence needs
#[derive(Clone)]
pub(crate) struct SessionCore {
    identity: SessionIdentity,
    state: Arc<Mutex<ChatSessionState>>,
    audio: Arc<AudioSession>,
    transfers: Arc<FileTransfers>,
    console: Arc<dyn Console>,
    outbound_done: CancellationToken,
}

impl SessionCore {
    pub(crate) fn new(ctx: &SessionContext, identity: SessionIdentity) -> Self {
        let audio = AudioSession::new(
            identity.clone(),
            ctx.transport.clone(),
            ctx.device.clone(),
            ctx.console.clone(),
            ctx.format.clone(),
            ctx.config.clone(),
        );
        let transfers = FileTransfers::new(
            identity.clone(),
            ctx.transport.clone(),
            ctx.console.clone(),
            ctx.transfer.clone(),
            &ctx.config,
        );

        Self {
            identity,
            state: Arc::new(Mutex::new(ChatSessionState::Joining)),
            audio: Arc::new(audio),
            transfers: Arc::new(transfers),
            console: ctx.console.clone(),
            outbound_done: CancellationToken::new(),
        }
    }

    pub(crate) fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub(crate) fn state(&self) -> ChatSessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ChatSessionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        debug!("Chat session {}: {} -> {}", self.identity.sender(), previous, state);
    }

    /// Lazy outbound sequence: the join message, then user input once `handoff` delivers it
    pub(crate) fn outbound_messages(
        &self,
        handoff: oneshot::Receiver<mpsc::Receiver<InputEvent>>,
    ) -> Outbound<ChatMessage> {
        let core = self.clone();

        let messages = stream! {
            let _closed = CloseOnDrop(core.clone());

            core.set_state(ChatSessionState::AwaitingHandshakeReply);
            yield ChatMessage::join(&core.identity);

            let mut input = match handoff.await {
                Ok(input) => input,
                Err(_) => {
                    debug!("Join as {} not accepted, outbound finished", core.identity.sender());
                    return;
                }
            };

            while let Some(event) = input.recv().await {
                let line = match event {
                    InputEvent::Line(line) => line,
                    InputEvent::Eof | InputEvent::Interrupted => {
                        info!("Input closed, leaving without notice");
                        break;
                    }
                };

                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Text(text) => yield ChatMessage::new(&core.identity, text),
                    Input::Command(Command::Quit) => {
                        yield ChatMessage::leave(&core.identity);
                        break;
                    }
                    Input::Command(command) => core.run_command(command).await,
                }
            }
        };

        messages.boxed()
    }

    async fn run_command(&self, command: Command) {
        debug!("Command: {:?}", command);

        match command {
            Command::MicOn => {
                if !self.ensure_audio_connection().await {
                    return;
                }
                // /listen on may have started them already
                if !self.audio.is_speakers_active() {
                    if let Err(e) = self.audio.start_speakers().await {
                        self.console.report_error("speakers", &e);
                    }
                }
                if let Err(e) = self.audio.start_mic().await {
                    self.console.report_error("microphone", &e);
                }
                self.close_audio_if_unused().await;
            }
            Command::MicOff => {
                self.audio.stop_mic();
                self.audio.stop_speakers();
                self.close_audio_if_unused().await;
            }
            Command::ListenOn => {
                if !self.ensure_audio_connection().await {
                    return;
                }
                if let Err(e) = self.audio.start_speakers().await {
                    self.console.report_error("speakers", &e);
                }
                self.close_audio_if_unused().await;
            }
            Command::ListenOff => {
                self.audio.stop_speakers();
                self.close_audio_if_unused().await;
            }
            Command::Upload { recipient, path } => self.transfers.start_upload(recipient, path),
            Command::Accept { offer, destination } => self.transfers.start_accept(offer, destination),
            Command::Reject { offer } => self.transfers.start_reject(offer),
            Command::Usage(usage) => self.console.notice(&format!("Usage: {}", usage)),
            Command::Help => self.console.notice(help_text()),
            Command::Unknown(raw) => {
                self.console.notice(&format!("Unknown command: {} (try /help)", raw));
            }
            Command::Quit => {}
        }
    }

    /// Open the audio channel unless it already is; false if that failed
    async fn ensure_audio_connection(&self) -> bool {
        if self.audio.is_connected() {
            return true;
        }
        match self.audio.start_audio_connection().await {
            Ok(()) => true,
            Err(e) => {
                self.console.report_error("audio connection", &e);
                false
            }
        }
    }

    /// The audio channel stays open only while mic or speakers use it
    async fn close_audio_if_unused(&self) {
        if self.audio.is_connected() && !self.audio.is_mic_active() && !self.audio.is_speakers_active() {
            self.audio.stop_audio_connection().await;
        }
    }
}

/// Marks the session closed however the outbound sequence ends
struct CloseOnDrop(SessionCore);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.set_state(ChatSessionState::Closed);
        self.0.outbound_done.cancel();
    }
}

/// An accepted chat session
///
/// Built by [`super::join_room`] once the server has answered the join with
/// something other than a name rejection. [`ChatSession::run`] consumes it.
pub struct ChatSession {
    core: SessionCore,
    config: SessionConfig,
    channel: DuplexChannel<ChatMessage>,
    /// The server's first reply, consumed by the handshake
    first: ChatMessage,
}

impl ChatSession {
    pub(crate) fn new(
        core: SessionCore,
        config: SessionConfig,
        channel: DuplexChannel<ChatMessage>,
        first: ChatMessage,
    ) -> Self {
        Self {
            core,
            config,
            channel,
            first,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        self.core.identity()
    }

    pub fn state(&self) -> ChatSessionState {
        self.core.state()
    }

    pub fn audio(&self) -> Arc<AudioSession> {
        self.core.audio.clone()
    }

    pub fn transfers(&self) -> Arc<FileTransfers> {
        self.core.transfers.clone()
    }

    /// Display inbound messages until either side finishes, then tear everything down
    ///
    /// Returns once the chat channel is closed, file transfers have stopped and
    /// the audio session has been cleaned up.
    pub async fn run(self) -> Result<(), ChatError> {
        let ChatSession {
            core,
            config,
            channel,
            first,
        } = self;
        let DuplexChannel { inbound, cancel } = channel;

        let inbound: Inbound<ChatMessage> = stream::iter([Ok(first)]).chain(inbound).boxed();
        let mut consumer = tokio::spawn(consume_inbound(core.clone(), inbound, cancel.clone()));

        let joined = tokio::select! {
            joined = &mut consumer => joined,
            _ = core.outbound_done.cancelled() => {
                match tokio::time::timeout(config.outbound_grace(), &mut consumer).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        debug!("Server did not close chat channel within {:?}", config.outbound_grace());
                        cancel.cancel();
                        consumer.await
                    }
                }
            }
        };

        cancel.cancel();
        core.set_state(ChatSessionState::Closed);

        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!("Chat receiver task failed: {}", e);
                Err(TransportError::Other(format!("receiver task failed: {}", e)).into())
            }
        };

        core.transfers.shutdown().await;
        core.audio.cleanup().await;
        info!("Chat session {} ended", core.identity.sender());
        result
    }
}

async fn consume_inbound(
    core: SessionCore,
    mut inbound: Inbound<ChatMessage>,
    cancel: CancellationToken,
) -> Result<(), ChatError> {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            item = inbound.next() => item,
        };

        match item {
            Some(Ok(msg)) => {
                if let Some(offer) = parse_file_request(&msg, &core.identity) {
                    core.transfers.offer_received(offer);
                } else if msg.sender == core.identity.sender() {
                    trace!("Suppressed own message {}", msg.trace_id);
                } else {
                    core.console.show_message(&msg);
                }
            }
            Some(Err(e)) => {
                let terminating = cancel.is_cancelled() || core.state() == ChatSessionState::Closed;
                if e.is_teardown_expected() && terminating {
                    debug!("Chat reception ended by teardown: {}", e);
                    return Ok(());
                }
                warn!("Chat reception failed: {}", e);
                return Err(e.into());
            }
            None => {
                if core.state() == ChatSessionState::Active {
                    info!("Chat channel closed by server");
                    core.console.notice("Connection closed by server.");
                }
                return Ok(());
            }
        }
    }
}
