use std::fmt;

/// Lifecycle of a chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSessionState {
    /// Join message not yet handed to the transport
    Joining,
    /// Join message sent, waiting for the server's first reply
    AwaitingHandshakeReply,
    /// Name accepted; user input flows to the server
    Active,
    /// Outbound sequence finished
    Closed,
}

impl fmt::Display for ChatSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChatSessionState::Joining => "joining",
            ChatSessionState::AwaitingHandshakeReply => "awaiting-handshake-reply",
            ChatSessionState::Active => "active",
            ChatSessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection phase of an audio session, as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioConnectionState {
    Idle,
    Connecting,
    Connected,
}
