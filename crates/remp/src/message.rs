use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::RempError;
use crate::can::CanFrame;
use crate::cli::CliPayload;
use crate::config::CanConfigPayload;
use crate::cursor::Reader;
use crate::pairing::PairingPayload;

pub const MAGIC: [u8; 4] = *b"REMP";
pub const VERSION: u8 = 1;
/// Size of the fixed header that precedes the token.
pub const HEADER_LEN: usize = 31;
pub const MAX_TOKEN_LEN: usize = 64;

pub const FLAG_RESPONSE: u8 = 0x01;
pub const FLAG_ACK_REQUESTED: u8 = 0x02;

/// Eight-byte hardware identifier of a dongle.
pub type DeviceId = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CanFrame = 0x01,
    CanConfig = 0x02,
    Cli = 0x03,
    Pairing = 0x04,
}

impl TryFrom<u8> for MessageType {
    type Error = RempError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::CanFrame),
            0x02 => Ok(Self::CanConfig),
            0x03 => Ok(Self::Cli),
            0x04 => Ok(Self::Pairing),
            other => Err(RempError::UnknownType(other)),
        }
    }
}

/// A complete REMP datagram: header, opaque token and raw payload.
///
/// The payload is kept as bytes so the header can be inspected (and matched
/// against pending requests) without committing to a payload schema. Use the
/// typed accessors to decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RempMessage {
    pub msg_type: MessageType,
    pub flags: u8,
    pub fw_build: u16,
    pub device_id: DeviceId,
    pub seq: u32,
    pub timestamp_us: u64,
    pub token: Vec<u8>,
    pub payload: Vec<u8>,
}

impl RempMessage {
    /// Creates an outbound message with a fresh sequence number and timestamp.
    pub fn new(msg_type: MessageType, device_id: DeviceId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            flags: 0,
            fw_build: 0,
            device_id,
            seq: next_sequence(),
            timestamp_us: now_us(),
            token: Vec::new(),
            payload,
        }
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, RempError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(RempError::TokenTooLong(self.token.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.token.len() + self.payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.push(self.msg_type as u8);
        buf.push(self.flags);
        buf.push(0);
        buf.push(self.token.len() as u8);
        buf.extend_from_slice(&self.fw_build.to_be_bytes());
        buf.extend_from_slice(&self.device_id);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_be_bytes());
        buf.extend_from_slice(&self.token);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RempError> {
        if buf.len() < HEADER_LEN {
            return Err(RempError::TooShort {
                need: HEADER_LEN,
                got: buf.len(),
            });
        }

        let mut r = Reader::new(buf);
        let magic: [u8; 4] = r.array()?;
        if magic != MAGIC {
            return Err(RempError::BadMagic(magic));
        }
        let version = r.u8()?;
        if version != VERSION {
            return Err(RempError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::try_from(r.u8()?)?;
        let flags = r.u8()?;
        r.skip(1)?;
        let token_len = r.u8()? as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(RempError::TokenTooLong(token_len));
        }
        let fw_build = r.u16()?;
        let device_id: DeviceId = r.array()?;
        let seq = r.u32()?;
        let timestamp_us = r.u64()?;

        let offset = HEADER_LEN + token_len;
        if offset > buf.len() {
            return Err(RempError::PayloadOffset {
                offset,
                len: buf.len(),
            });
        }
        let token = r.take(token_len)?.to_vec();
        let payload = r.rest().to_vec();

        Ok(Self {
            msg_type,
            flags,
            fw_build,
            device_id,
            seq,
            timestamp_us,
            token,
            payload,
        })
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), RempError> {
        if self.msg_type != expected {
            return Err(RempError::WrongType {
                expected,
                got: self.msg_type,
            });
        }
        Ok(())
    }

    pub fn can_frame(&self) -> Result<CanFrame, RempError> {
        self.expect_type(MessageType::CanFrame)?;
        CanFrame::decode(&self.payload)
    }

    pub fn can_config(&self) -> Result<CanConfigPayload, RempError> {
        self.expect_type(MessageType::CanConfig)?;
        CanConfigPayload::decode(&self.payload)
    }

    pub fn cli(&self) -> Result<CliPayload, RempError> {
        self.expect_type(MessageType::Cli)?;
        CliPayload::decode(&self.payload)
    }

    pub fn pairing(&self) -> Result<PairingPayload, RempError> {
        self.expect_type(MessageType::Pairing)?;
        PairingPayload::decode(&self.payload)
    }
}

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Process-wide monotonic sequence number; wraps at 2^32.
pub fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Lowercase hex form used for device ids in logs, config and JSON.
pub fn device_id_hex(id: &DeviceId) -> String {
    hex::encode(id)
}

pub fn parse_device_id(s: &str) -> Option<DeviceId> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}
