//! Relays CAN traffic between the two dongles of a group.
//!
//! Each dongle is served by one agent. A frame from one side goes live to the
//! other side's agent when it is connected; otherwise it is appended to a
//! durable per-direction buffer and replayed when that agent reconnects.

mod buffer;
mod engine;
mod group;

pub use buffer::{
    BufferKey, BufferedFrame, DurableLog, LastSeenStore, LogFuture, MemoryLastSeen, MemoryLog,
    DEFAULT_MAX_BUFFERED,
};
pub use engine::{DataLink, RelayConfig, RelayEngine, RelayOutcome};
pub use group::{Direction, Group, GroupMode, GroupState, Side};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("group {group} has no dongle {dongle}")]
    NotInGroup { group: String, dongle: String },

    #[error("data link to agent {0} is down")]
    LinkDown(String),

    #[error("durable log error: {0}")]
    Log(String),
}
