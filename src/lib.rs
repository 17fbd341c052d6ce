pub mod audio;
pub mod config;
pub mod console;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

pub use audio::{AudioDevice, AudioDeviceFactory, AudioFormat, FrameSink, FrameSource, SampleFormat};
pub use config::Config;
pub use console::{Console, InputEvent, TerminalConsole};
pub use error::{AudioError, ChatError, DeviceError, ProtocolError, TransferError, TransportError, UsageError};
pub use protocol::{AudioFrame, ChatMessage, FileChunk, FileTransferRequest, FileTransferResponse, SessionIdentity};
pub use session::{
    join_room, AudioConnectionState, AudioSession, AudioStats, ChatSession, ChatSessionState, FileTransfers,
    NameSource, Received, SendOutcome, SessionConfig, SessionContext, TransferConfig,
};
pub use transport::{DuplexChannel, NatsTransport, Transport};
