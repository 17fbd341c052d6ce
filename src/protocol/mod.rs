//! Wire schemas and conventions shared by the chat and audio channels
//!
//! - `ChatMessage` / `AudioFrame` payloads
//! - The session identity attached to both channels
//! - The server sentinel used to reject a name during the join handshake
//! - File offers and chunks (`transfer`)

pub mod messages;
pub mod transfer;

pub use messages::{AudioFrame, AudioFrameMessage, ChatMessage};
pub use transfer::{
    parse_file_request, transfer_metadata, FileChunk, FileChunkMessage, FileTransferRequest, FileTransferResponse,
    TransferRole, CHUNK_SIZE, FILE_REQUEST_PREFIX, FILE_TRANSFER_SENDER,
};

/// Reserved sender name used by the server for its own announcements
pub const SERVER_SENDER: &str = "Server";

/// Prefix of a server message rejecting the requested name
pub const NAME_TAKEN_PREFIX: &str = "ERROR:NAME_TAKEN:";

/// Metadata key carrying the sender name on the audio channel
pub const METADATA_SENDER: &str = "sender";

/// Metadata key carrying the room id on the audio channel
pub const METADATA_ROOM_ID: &str = "room-id";

/// Who we are and where we are talking. Fixed for the life of a session pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    sender: String,
    room_id: String,
}

impl SessionIdentity {
    pub fn new(sender: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            room_id: room_id.into(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Key/value pairs attached once to the audio channel
    pub fn metadata(&self) -> Vec<(String, String)> {
        vec![
            (METADATA_SENDER.to_string(), self.sender.clone()),
            (METADATA_ROOM_ID.to_string(), self.room_id.clone()),
        ]
    }
}

/// If `msg` is the server's name-collision sentinel, return the detail text after the prefix
pub fn name_taken_reason(msg: &ChatMessage) -> Option<&str> {
    if msg.sender != SERVER_SENDER {
        return None;
    }
    msg.message.strip_prefix(NAME_TAKEN_PREFIX)
}
