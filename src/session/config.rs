use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for chat/audio session lifecycles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How many names may be tried before the join handshake gives up
    /// Default: 5
    pub max_join_attempts: u32,

    /// Upper bound on waiting for the audio receiver task during teardown
    /// Default: 1000 ms
    pub receiver_join_timeout_ms: u64,

    /// How long to wait for the server to close the chat channel after we quit
    /// Default: 1000 ms
    pub outbound_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_join_attempts: 5,
            receiver_join_timeout_ms: 1000,
            outbound_grace_ms: 1000,
        }
    }
}

impl SessionConfig {
    pub fn receiver_join_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_join_timeout_ms)
    }

    pub fn outbound_grace(&self) -> Duration {
        Duration::from_millis(self.outbound_grace_ms)
    }
}

/// Tuning for file transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Where accepted files land when no destination is given; `~` is expanded
    /// Default: ~/Downloads/loqa-rooms
    pub download_dir: String,

    /// Bytes per chunk
    /// Default: 65536
    pub chunk_size: usize,

    /// How long an offer waits for the recipient's answer
    /// Default: 65000 ms (the server itself gives up after 60 s)
    pub answer_timeout_ms: u64,

    /// Offers kept waiting for /accept or /reject; later ones are declined
    /// Default: 10
    pub max_pending_offers: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: "~/Downloads/loqa-rooms".to_string(),
            chunk_size: crate::protocol::CHUNK_SIZE,
            answer_timeout_ms: 65_000,
            max_pending_offers: 10,
        }
    }
}

impl TransferConfig {
    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.download_dir).into_owned())
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}
