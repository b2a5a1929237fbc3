pub mod constants;
pub mod data;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{ChannelKind, MessageType};
pub use data::{CanFrameRelay, DataMessage};
pub use envelope::ControlMessage;
