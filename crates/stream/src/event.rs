use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Presence,
    CanFrame,
    Log,
    CommandStatus,
    GroupState,
    StreamReset,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::CanFrame => "can_frame",
            Self::Log => "log",
            Self::CommandStatus => "command_status",
            Self::GroupState => "group_state",
            Self::StreamReset => "stream_reset",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl StreamEvent {
    /// Renders the event as one `text/event-stream` record.
    pub fn to_sse(&self) -> String {
        let body = serde_json::json!({ "data": self.data, "ts": self.ts });
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.id, self.kind, body)
    }
}

/// Parses a `Last-Event-ID` header value. Anything that is not a plain
/// non-negative integer means "no resume point".
pub fn parse_last_event_id(value: Option<&str>) -> Option<u64> {
    value.map(str::trim).and_then(|v| v.parse().ok())
}
