use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::SessionIdentity;

/// Chat message exchanged over the chat channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub message: String,
    pub room_id: String,
    /// Epoch seconds
    pub timestamp: i64,
    /// Unique per outbound message, used only for correlation/display
    pub trace_id: String,
}

impl ChatMessage {
    /// Build a message from this identity with a fresh trace id and the current time
    pub fn new(identity: &SessionIdentity, message: impl Into<String>) -> Self {
        Self {
            sender: identity.sender().to_string(),
            message: message.into(),
            room_id: identity.room_id().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// First message on every chat channel
    pub fn join(identity: &SessionIdentity) -> Self {
        Self::new(identity, format!("{} joined the room.", identity.sender()))
    }

    /// Last message before a deliberate quit
    pub fn leave(identity: &SessionIdentity) -> Self {
        Self::new(identity, format!("{} left the room.", identity.sender()))
    }
}

/// One chunk of raw PCM. Frames carry no identity; any of them may be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Audio frame as it travels on the wire
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioFrameMessage {
    pub data: String, // Base64-encoded PCM bytes
}

impl From<&AudioFrame> for AudioFrameMessage {
    fn from(frame: &AudioFrame) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(&frame.data),
        }
    }
}

impl AudioFrameMessage {
    pub fn into_frame(self) -> Result<AudioFrame> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .context("Audio frame payload is not valid base64")?;
        Ok(AudioFrame { data })
    }
}
