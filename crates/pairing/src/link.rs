use std::future::Future;
use std::pin::Pin;

/// What the physical device said, as relayed by its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// Accepted. For a start, `seconds` is the pairing window and `nonce`
    /// the device-issued pairing nonce.
    Ok { seconds: u16, nonce: Vec<u8> },
    InvalidPin,
    /// The device itself is rate-limiting for `seconds`.
    Cooldown { seconds: u16 },
    /// The device's own pairing window closed.
    Expired,
    /// Any other refusal (not armed, busy, unknown status).
    Rejected(String),
}

/// The agent could not be reached or did not answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LinkError(pub String);

pub type LinkFuture<'a> = Pin<Box<dyn Future<Output = Result<DeviceReply, LinkError>> + Send + 'a>>;

/// Path from the backend to a dongle's pairing endpoint.
pub trait PairingLink: Send + Sync {
    /// Arms pairing mode on the device.
    fn start<'a>(&'a self, dongle_id: &'a str) -> LinkFuture<'a>;

    /// Submits a PIN along with the secret the device should keep on success.
    fn submit<'a>(
        &'a self,
        dongle_id: &'a str,
        pin: &'a str,
        nonce: [u8; 16],
        secret: &'a [u8],
    ) -> LinkFuture<'a>;
}
