//! Terminal boundary
//!
//! Sessions never print directly. Everything the user sees goes through a
//! [`Console`], and everything the user types arrives as an [`InputEvent`].

mod terminal;

pub use terminal::{format_message, ChatInput, TerminalConsole};

use crate::protocol::ChatMessage;

/// Events produced by the line reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// User submitted a line (untrimmed)
    Line(String),
    /// End of file (Ctrl+D)
    Eof,
    /// Interrupt signal (Ctrl+C)
    Interrupted,
}

/// Display interface the sessions report through
pub trait Console: Send + Sync {
    /// Render a chat message from another participant
    fn show_message(&self, msg: &ChatMessage);

    /// Informational status line
    fn notice(&self, text: &str);

    /// A failure, with the operation that hit it
    fn report_error(&self, operation: &str, err: &dyn std::error::Error);
}

/// Help text for the in-chat commands
pub fn help_text() -> &'static str {
    "Available commands:\n\
     \x20 /help                      Show this help\n\
     \x20 /quit, /exit, /disconnect  Leave the room\n\
     \x20 /mic on                    Open audio and start sending your voice\n\
     \x20 /mic off                   Stop sending and listening\n\
     \x20 /listen on                 Open audio and listen only\n\
     \x20 /listen off                Stop listening\n\
     \x20 /upload <user> <path>      Offer a file to someone in the room\n\
     \x20 /accept [id] [destination] Accept a file offer (oldest if no id)\n\
     \x20 /reject [id], /cancel [id] Decline a file offer"
}
