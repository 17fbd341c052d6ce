//! Error types for chat and audio sessions
//!
//! Each family maps to one containment boundary: transport errors end the
//! owning session, device errors end only the toggle that hit them, protocol
//! errors drive the join retry, and usage errors are purely informational.
//! Transfer errors end only the transfer that hit them.

use thiserror::Error;

/// Failure reported by a duplex channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel was cancelled (usually by our own teardown)
    #[error("channel cancelled")]
    Cancelled,

    /// The remote service could not be reached or went away
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Anything else the transport or the server reported
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this error is the normal consequence of tearing a channel down
    pub fn is_teardown_expected(&self) -> bool {
        matches!(self, TransportError::Cancelled | TransportError::Unavailable(_))
    }

    /// Map a wire status code onto the taxonomy
    pub fn from_status(code: &str, detail: impl Into<String>) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "CANCELLED" => TransportError::Cancelled,
            "UNAVAILABLE" => TransportError::Unavailable(detail.into()),
            other => TransportError::Other(format!("{}: {}", other, detail.into())),
        }
    }
}

/// Audio capture/playback failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("failed to open audio device: {0}")]
    OpenFailed(String),

    #[error("audio I/O failure: {0}")]
    IoFailure(String),
}

/// Server-side rejection carried over the chat schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("name unavailable: {0}")]
    NameTaken(String),
}

/// Caller asked for something the current state does not allow
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    #[error("audio connection not established; use /mic on or /listen on first")]
    ConnectionNotEstablished,
}

/// Errors surfaced by [`crate::session::AudioSession`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// Errors surfaced by [`crate::session::ChatSession`] and the join handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("gave up joining after {0} attempts")]
    JoinAttemptsExhausted(u32),

    #[error("channel closed before the server answered the join request")]
    ClosedDuringHandshake,

    #[error("name must not be empty")]
    EmptyName,

    #[error("join aborted: {0}")]
    JoinAborted(String),
}

/// Errors surfaced by [`crate::session::FileTransfers`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("file error: {0}")]
    Io(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("no pending file offers")]
    NoPendingOffer,

    #[error("no pending file offer matches '{0}'")]
    UnknownOffer(String),

    #[error("'{0}' matches more than one pending file offer")]
    AmbiguousOffer(String),

    #[error("{0} did not answer the file offer in time")]
    NoAnswer(String),

    #[error("expected chunk {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("transfer ended before the last chunk")]
    Incomplete,
}

impl TransferError {
    pub fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        TransferError::Io(format!("{}: {}", context, err))
    }
}
