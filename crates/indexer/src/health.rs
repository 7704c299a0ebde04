use serde::Serialize;
use std::time::SystemTime;

/// Consumer lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Live view of the firehose consumer, published over a watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerHealth {
    pub state: ConsumerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<SystemTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub events_seen: u64,
    pub records_upserted: u64,
    pub records_deleted: u64,
    /// Commits dropped by the collection or identity filter.
    pub events_skipped: u64,
    pub malformed_records: u64,
    pub decode_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_saved_cursor: Option<u64>,
}

impl ConsumerHealth {
    #[must_use]
    pub fn initial() -> Self {
        Self {
            state: ConsumerState::Disconnected,
            last_connected: None,
            last_error: None,
            consecutive_failures: 0,
            events_seen: 0,
            records_upserted: 0,
            records_deleted: 0,
            events_skipped: 0,
            malformed_records: 0,
            decode_errors: 0,
            last_saved_cursor: None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConsumerState::Streaming
    }
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        Self::initial()
    }
}
