use serde::{Deserialize, Serialize};

/// Counters for one audio session, across all of its connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStats {
    /// Audio channels successfully opened
    pub connections_opened: usize,

    /// Captured frames handed to the transport
    pub frames_sent: usize,

    /// Inbound frames written to the playback sink
    pub frames_played: usize,

    /// Inbound frames discarded because speakers were off
    pub frames_dropped: usize,
}
