//! Pairing: claiming ownership of a dongle by proving knowledge of the PIN
//! it shows, with a lockout after repeated failures.
//!
//! A session moves `Active -> {Success, Failed, Expired, Hold}` and never
//! leaves a terminal state. Expiry is applied lazily on the next access.

pub mod clock;
pub mod link;
pub mod service;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use link::{DeviceReply, LinkError, LinkFuture, PairingLink};
pub use service::{PairingConfig, PairingService, StartOutcome, SubmitOutcome};
pub use store::{MemoryStore, PairingStore, SecretStore, StoreError, StoreFuture};
pub use types::{
    AuditAction, AuditEntry, DongleRecord, HoldReason, Ownership, PairingSession, SecurityHold,
    SessionStatus,
};

use uuid::Uuid;

/// Errors for pairing operations.
///
/// Device-level rejections (wrong PIN, cooldown) are not errors; they come
/// back as [`StartOutcome`] / [`SubmitOutcome`] variants.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("PIN must be exactly 6 digits")]
    MalformedPin,

    #[error("pairing session {0} not found")]
    SessionNotFound(Uuid),

    #[error("pairing session belongs to another user")]
    NotSessionOwner,

    #[error("pairing session is {0:?}")]
    SessionNotActive(SessionStatus),

    #[error("unknown dongle {0}")]
    UnknownDongle(String),

    #[error("dongle {0} is owned by another user")]
    AlreadyOwned(String),

    #[error("pairing session has no device nonce")]
    NotArmed,

    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
