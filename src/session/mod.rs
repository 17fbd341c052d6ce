//! Chat and audio session management
//!
//! This module provides:
//! - `join_room`: the join handshake with bounded name-collision retry
//! - `ChatSession`: the accepted chat channel, user commands, echo suppression
//! - `AudioSession`: the audio channel gated by mic/speaker toggles
//! - `FileTransfers`: file offers, answers and chunked transfers
//! - Session state, tuning and statistics types

mod audio;
mod chat;
mod commands;
mod config;
mod handshake;
mod state;
mod stats;
mod transfer;

pub use audio::AudioSession;
pub use chat::{ChatSession, SessionContext};
pub use commands::{parse_input, Command, Input};
pub use config::{SessionConfig, TransferConfig};
pub use handshake::{join_room, NameSource};
pub use state::{AudioConnectionState, ChatSessionState};
pub use stats::AudioStats;
pub use transfer::{short_id, FileTransfers, Received, SendOutcome};
