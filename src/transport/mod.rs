//! Duplex streaming transport
//!
//! A channel is opened with a lazy outbound sequence that the transport
//! drives until it ends (which closes the send side). The caller gets back
//! the inbound sequence and a cancel handle. Chat, audio and every file
//! transfer open their own channel; they share nothing but the service
//! identity. File offers and answers are plain request/reply calls.

pub mod nats;

use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::protocol::{AudioFrame, ChatMessage, FileChunk, FileTransferRequest, FileTransferResponse};

pub use nats::NatsTransport;

/// Items we send, pulled lazily by the transport
pub type Outbound<T> = BoxStream<'static, T>;

/// Items the server sends, ending when the channel closes
pub type Inbound<T> = BoxStream<'static, Result<T, TransportError>>;

/// Key/value pairs attached once when a channel opens
pub type Metadata = Vec<(String, String)>;

/// The receive half of an open channel plus its cancel handle
pub struct DuplexChannel<T> {
    pub inbound: Inbound<T>,
    pub cancel: CancellationToken,
}

impl<T> DuplexChannel<T> {
    pub fn new(inbound: Inbound<T>, cancel: CancellationToken) -> Self {
        Self { inbound, cancel }
    }

    /// Request cancellation; the inbound sequence ends shortly after
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Opens duplex channels against the remote chat service
///
/// Implementations:
/// - `NatsTransport`: subjects on a NATS server
/// - test doubles: scripted in-memory servers
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open the chat channel
    async fn open_chat(
        &self,
        outbound: Outbound<ChatMessage>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<ChatMessage>, TransportError>;

    /// Open the audio channel
    async fn open_audio(
        &self,
        outbound: Outbound<AudioFrame>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<AudioFrame>, TransportError>;

    /// Offer a file to another participant and wait for their answer
    ///
    /// May wait as long as the recipient takes; callers bound it.
    async fn request_file_transfer(
        &self,
        request: FileTransferRequest,
    ) -> Result<FileTransferResponse, TransportError>;

    /// Answer a file offer made to us
    async fn respond_file_transfer(&self, response: FileTransferResponse) -> Result<(), TransportError>;

    /// Open a chunk channel for one transfer; `metadata` names the role and transfer id
    async fn open_file_transfer(
        &self,
        outbound: Outbound<FileChunk>,
        metadata: Metadata,
    ) -> Result<DuplexChannel<FileChunk>, TransportError>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
