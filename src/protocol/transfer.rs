//! File transfer schemas
//!
//! An offer travels as a unary request the server forwards to the recipient
//! as a sentinel chat message. Once accepted, the bytes move over a chunk
//! channel that both peers open with the same transfer id.

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, SessionIdentity};

/// Sender name the server uses for file offers on the chat channel
pub const FILE_TRANSFER_SENDER: &str = "Sistema-FileTransfer";

/// `FILE_REQUEST:<transfer id>:<sender>:<filename>:<size>:<timestamp>`
pub const FILE_REQUEST_PREFIX: &str = "FILE_REQUEST:";

/// Default chunk payload size
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Metadata key telling the server which end of a transfer a channel is
pub const METADATA_ROLE: &str = "role";

/// Metadata key carrying the transfer id on a chunk channel
pub const METADATA_TRANSFER_ID: &str = "transfer-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Sender,
    Receiver,
}

impl TransferRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferRole::Sender => "sender",
            TransferRole::Receiver => "receiver",
        }
    }
}

/// Metadata attached to a chunk channel
pub fn transfer_metadata(role: TransferRole, transfer_id: &str) -> Vec<(String, String)> {
    vec![
        (METADATA_ROLE.to_string(), role.as_str().to_string()),
        (METADATA_TRANSFER_ID.to_string(), transfer_id.to_string()),
    ]
}

/// Offer of one file to one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferRequest {
    pub transfer_id: String,
    pub sender: String,
    pub recipient: String,
    pub room_id: String,
    pub filename: String,
    pub file_size: u64,
    pub timestamp: i64,
}

impl FileTransferRequest {
    /// New offer from `identity` with a fresh transfer id
    pub fn new(identity: &SessionIdentity, recipient: &str, filename: &str, file_size: u64) -> Self {
        Self {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            sender: identity.sender().to_string(),
            recipient: recipient.to_string(),
            room_id: identity.room_id().to_string(),
            filename: filename.to_string(),
            file_size,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// The chat message the server delivers to the recipient
    pub fn announcement(&self) -> ChatMessage {
        ChatMessage {
            sender: FILE_TRANSFER_SENDER.to_string(),
            message: format!(
                "{}{}:{}:{}:{}:{}",
                FILE_REQUEST_PREFIX, self.transfer_id, self.sender, self.filename, self.file_size, self.timestamp
            ),
            room_id: self.room_id.clone(),
            timestamp: self.timestamp,
            trace_id: self.transfer_id.clone(),
        }
    }

    /// Answer to this offer from its recipient
    pub fn answer(&self, accepted: bool) -> FileTransferResponse {
        FileTransferResponse {
            transfer_id: self.transfer_id.clone(),
            accepted,
            sender: self.recipient.clone(),
            recipient: self.sender.clone(),
            room_id: self.room_id.clone(),
        }
    }
}

/// Recipient's answer; `sender` is the one answering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferResponse {
    pub transfer_id: String,
    pub accepted: bool,
    pub sender: String,
    pub recipient: String,
    pub room_id: String,
}

/// Parse a file offer announced on the chat channel to `identity`
///
/// The filename may itself contain `:`; the id and sender are taken from the
/// left and the size and timestamp from the right.
pub fn parse_file_request(msg: &ChatMessage, identity: &SessionIdentity) -> Option<FileTransferRequest> {
    if msg.sender != FILE_TRANSFER_SENDER {
        return None;
    }
    let body = msg.message.strip_prefix(FILE_REQUEST_PREFIX)?;
    let (transfer_id, rest) = body.split_once(':')?;
    let (sender, rest) = rest.split_once(':')?;
    let (rest, timestamp) = rest.rsplit_once(':')?;
    let (filename, file_size) = rest.rsplit_once(':')?;

    if transfer_id.is_empty() || sender.is_empty() || filename.is_empty() {
        return None;
    }

    Some(FileTransferRequest {
        transfer_id: transfer_id.to_string(),
        sender: sender.to_string(),
        recipient: identity.sender().to_string(),
        room_id: identity.room_id().to_string(),
        filename: filename.to_string(),
        file_size: file_size.parse().ok()?,
        timestamp: timestamp.parse().ok()?,
    })
}

/// One slice of a file. The last chunk may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: String,
    pub data: Vec<u8>,
    pub chunk_number: u32,
    pub is_last: bool,
}

/// File chunk as it travels on the wire
#[derive(Debug, Serialize, Deserialize)]
pub struct FileChunkMessage {
    pub transfer_id: String,
    pub data: String, // Base64-encoded file bytes
    pub chunk_number: u32,
    pub is_last: bool,
}

impl From<&FileChunk> for FileChunkMessage {
    fn from(chunk: &FileChunk) -> Self {
        Self {
            transfer_id: chunk.transfer_id.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&chunk.data),
            chunk_number: chunk.chunk_number,
            is_last: chunk.is_last,
        }
    }
}

impl FileChunkMessage {
    pub fn into_chunk(self) -> Result<FileChunk> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .context("File chunk payload is not valid base64")?;
        Ok(FileChunk {
            transfer_id: self.transfer_id,
            data,
            chunk_number: self.chunk_number,
            is_last: self.is_last,
        })
    }
}
