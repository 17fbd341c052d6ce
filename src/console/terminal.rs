//! Line-oriented terminal on top of `rustyline_async`
//!
//! Output goes through the readline `SharedWriter` so incoming messages do
//! not clobber the line being typed.

use std::io::Write;

use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use rustyline_async::{Readline, ReadlineError, ReadlineEvent, SharedWriter};
use tracing::debug;

use super::{Console, InputEvent};
use crate::protocol::ChatMessage;

/// Async line reader for the chat loop
pub struct ChatInput {
    rl: Readline,
}

impl ChatInput {
    /// Create the reader plus a writer that prints above the prompt
    pub fn new(prompt: String) -> Result<(Self, SharedWriter), ReadlineError> {
        let (rl, stdout) = Readline::new(prompt)?;
        Ok((Self { rl }, stdout))
    }

    /// Read one line
    ///
    /// Readline errors are treated as end of input.
    pub async fn read_line(&mut self) -> InputEvent {
        match self.rl.readline().await {
            Ok(ReadlineEvent::Line(line)) => InputEvent::Line(line),
            Ok(ReadlineEvent::Eof) => InputEvent::Eof,
            Ok(ReadlineEvent::Interrupted) => InputEvent::Interrupted,
            Err(e) => {
                debug!("Readline failed: {}", e);
                InputEvent::Eof
            }
        }
    }
}

/// [`Console`] printing through a readline writer
pub struct TerminalConsole {
    out: Mutex<SharedWriter>,
}

impl TerminalConsole {
    pub fn new(out: SharedWriter) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn write_line(&self, text: &str) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{}", text) {
            debug!("Failed to write to terminal: {}", e);
        }
    }
}

impl Console for TerminalConsole {
    fn show_message(&self, msg: &ChatMessage) {
        self.write_line(&format_message(msg));
    }

    fn notice(&self, text: &str) {
        self.write_line(&format!("* {}", text));
    }

    fn report_error(&self, operation: &str, err: &dyn std::error::Error) {
        self.write_line(&format!("! {} failed: {}", operation, err));
    }
}

/// `[TraceID: ..]` line followed by `[HH:MM] sender: message`
pub fn format_message(msg: &ChatMessage) -> String {
    let time = Local
        .timestamp_opt(msg.timestamp, 0)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());

    format!(
        "[TraceID: {}]\n[{}] {}: {}",
        msg.trace_id, time, msg.sender, msg.message
    )
}
