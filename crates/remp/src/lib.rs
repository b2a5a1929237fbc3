//! REMP: the binary protocol spoken between an agent and its dongles over UDP.
//!
//! # Framing
//!
//! ```text
//! [4 bytes: magic "REMP"][1: version][1: type][1: flags][1: reserved][1: token_len]
//! [2 BE: fw_build][8: device_id][4 BE: seq][8 BE: timestamp_us]
//! [token_len bytes: token][payload ...]
//! ```
//!
//! The payload layout is selected by the message type, see [`can`],
//! [`config`], [`cli`] and [`pairing`]. Every multi-byte integer is
//! big-endian.

pub mod can;
pub mod cli;
pub mod config;
mod cursor;
pub mod message;
pub mod pairing;

pub use can::CanFrame;
pub use cli::{CliPayload, CliRequest, CliResponse, CliStatus, CorrelationId, new_correlation_id};
pub use config::{CanConfig, CanConfigFlags, CanConfigPayload, CanMode, ConfigStatus};
pub use message::{
    DeviceId, HEADER_LEN, MAGIC, MAX_TOKEN_LEN, MessageType, RempMessage, VERSION,
    device_id_hex, next_sequence, now_us, parse_device_id,
};
pub use pairing::{PairingNonce, PairingPayload, PairingStatus, is_valid_pin};

/// Errors produced while encoding or decoding REMP messages.
///
/// Decoding is all-or-nothing: any of these means the datagram is unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RempError {
    #[error("message too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("token too long: {0} bytes (max {MAX_TOKEN_LEN})")]
    TokenTooLong(usize),

    #[error("payload offset {offset} exceeds message length {len}")]
    PayloadOffset { offset: usize, len: usize },

    #[error("unknown {field} value {value}")]
    UnknownValue { field: &'static str, value: u8 },

    #[error("CAN id 0x{id:x} out of range (extended: {extended})")]
    CanIdOutOfRange { id: u32, extended: bool },

    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("invalid PIN: expected 6 ASCII digits")]
    InvalidPin,

    #[error("expected a {expected:?} message, got {got:?}")]
    WrongType {
        expected: MessageType,
        got: MessageType,
    },
}
