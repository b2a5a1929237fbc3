//! UDP endpoint an agent uses to talk to its dongles.
//!
//! [`DongleTransport`] owns the socket. Requests register a matcher and wait
//! for the first inbound datagram it accepts; CAN frames nobody is waiting
//! for are fanned out to frame subscribers. [`DongleClient`] layers the typed
//! device operations on top.

pub mod device;
pub mod matchers;
pub mod transport;

pub use device::{DongleClient, PairingReply};
pub use transport::{DongleTransport, Inbound, InboundFrame, Matcher};

use canbridge_remp::RempError;

/// Errors from the dongle transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] RempError),

    #[error("request timed out")]
    Timeout,

    #[error("transport closed")]
    Closed,

    #[error("socket error: {0}")]
    Socket(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}
