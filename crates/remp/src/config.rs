//! CAN controller configuration payload.
//!
//! ```text
//! get/set:  [1: action][1: reserved][fields]
//! response: [1: action][1: status][1: reserved][fields]
//! fields:   [4 BE: bitrate][2 BE: sample_point_permille][2 BE: prescaler]
//!           [1: sjw][1: tseg1][1: tseg2][1: mode][1: flags][1: reserved]
//! ```

use serde::{Deserialize, Serialize};

use crate::RempError;
use crate::cursor::Reader;

const ACTION_GET: u8 = 0;
const ACTION_SET: u8 = 1;
const ACTION_RESPONSE: u8 = 2;

const FLAG_USE_RAW: u8 = 0x01;
const FLAG_AUTO_RETX: u8 = 0x02;
const FLAG_TX_PAUSE: u8 = 0x04;
const FLAG_PROTOCOL_EXC: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanMode {
    Normal,
    ListenOnly,
    Loopback,
    ExtLoop,
}

impl CanMode {
    fn to_byte(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::ListenOnly => 1,
            Self::Loopback => 2,
            Self::ExtLoop => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self, RempError> {
        match b {
            0 => Ok(Self::Normal),
            1 => Ok(Self::ListenOnly),
            2 => Ok(Self::Loopback),
            3 => Ok(Self::ExtLoop),
            value => Err(RempError::UnknownValue {
                field: "CAN mode",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfigFlags {
    pub use_raw: bool,
    pub auto_retx: bool,
    pub tx_pause: bool,
    pub protocol_exc: bool,
}

impl CanConfigFlags {
    pub fn bits(&self) -> u8 {
        let mut b = 0;
        if self.use_raw {
            b |= FLAG_USE_RAW;
        }
        if self.auto_retx {
            b |= FLAG_AUTO_RETX;
        }
        if self.tx_pause {
            b |= FLAG_TX_PAUSE;
        }
        if self.protocol_exc {
            b |= FLAG_PROTOCOL_EXC;
        }
        b
    }

    pub fn from_bits(b: u8) -> Self {
        Self {
            use_raw: b & FLAG_USE_RAW != 0,
            auto_retx: b & FLAG_AUTO_RETX != 0,
            tx_pause: b & FLAG_TX_PAUSE != 0,
            protocol_exc: b & FLAG_PROTOCOL_EXC != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanConfig {
    pub bitrate: u32,
    pub sample_point_permille: u16,
    pub prescaler: u16,
    pub sjw: u8,
    pub tseg1: u8,
    pub tseg2: u8,
    pub mode: CanMode,
    #[serde(default)]
    pub flags: CanConfigFlags,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            bitrate: 500_000,
            sample_point_permille: 875,
            prescaler: 0,
            sjw: 1,
            tseg1: 0,
            tseg2: 0,
            mode: CanMode::Normal,
            flags: CanConfigFlags {
                auto_retx: true,
                ..Default::default()
            },
        }
    }
}

impl CanConfig {
    fn write_fields(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.bitrate.to_be_bytes());
        buf.extend_from_slice(&self.sample_point_permille.to_be_bytes());
        buf.extend_from_slice(&self.prescaler.to_be_bytes());
        buf.push(self.sjw);
        buf.push(self.tseg1);
        buf.push(self.tseg2);
        buf.push(self.mode.to_byte());
        buf.push(self.flags.bits());
        buf.push(0);
    }

    fn read_fields(r: &mut Reader<'_>) -> Result<Self, RempError> {
        let bitrate = r.u32()?;
        let sample_point_permille = r.u16()?;
        let prescaler = r.u16()?;
        let sjw = r.u8()?;
        let tseg1 = r.u8()?;
        let tseg2 = r.u8()?;
        let mode = CanMode::from_byte(r.u8()?)?;
        let flags = CanConfigFlags::from_bits(r.u8()?);
        r.skip(1)?;
        Ok(Self {
            bitrate,
            sample_point_permille,
            prescaler,
            sjw,
            tseg1,
            tseg2,
            mode,
            flags,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Ok,
    Invalid,
    ApplyFailed,
}

impl ConfigStatus {
    fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Invalid => 1,
            Self::ApplyFailed => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self, RempError> {
        match b {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Invalid),
            2 => Ok(Self::ApplyFailed),
            value => Err(RempError::UnknownValue {
                field: "config status",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanConfigPayload {
    Get,
    Set(CanConfig),
    Response {
        status: ConfigStatus,
        config: CanConfig,
    },
}

impl CanConfigPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        match self {
            Self::Get => {
                buf.push(ACTION_GET);
                buf.push(0);
                // A get carries zeroed fields so every request has the same size.
                buf.resize(16, 0);
            }
            Self::Set(config) => {
                buf.push(ACTION_SET);
                buf.push(0);
                config.write_fields(&mut buf);
            }
            Self::Response { status, config } => {
                buf.push(ACTION_RESPONSE);
                buf.push(status.to_byte());
                buf.push(0);
                config.write_fields(&mut buf);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RempError> {
        let mut r = Reader::new(buf);
        match r.u8()? {
            ACTION_GET => {
                r.skip(1)?;
                Ok(Self::Get)
            }
            ACTION_SET => {
                r.skip(1)?;
                Ok(Self::Set(CanConfig::read_fields(&mut r)?))
            }
            ACTION_RESPONSE => {
                let status = ConfigStatus::from_byte(r.u8()?)?;
                r.skip(1)?;
                let config = CanConfig::read_fields(&mut r)?;
                Ok(Self::Response { status, config })
            }
            value => Err(RempError::UnknownValue {
                field: "config action",
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom() -> CanConfig {
        CanConfig {
            bitrate: 250_000,
            sample_point_permille: 800,
            prescaler: 4,
            sjw: 2,
            tseg1: 13,
            tseg2: 2,
            mode: CanMode::ListenOnly,
            flags: CanConfigFlags {
                use_raw: true,
                auto_retx: false,
                tx_pause: true,
                protocol_exc: true,
            },
        }
    }

    #[test]
    fn set_roundtrip() {
        let payload = CanConfigPayload::Set(custom());
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[2..6], &250_000u32.to_be_bytes());
        assert_eq!(bytes[13], 1);
        assert_eq!(bytes[14], 0x0d);
        assert_eq!(CanConfigPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn response_has_status_ahead_of_fields() {
        let payload = CanConfigPayload::Response {
            status: ConfigStatus::ApplyFailed,
            config: custom(),
        };
        let bytes = payload.encode();
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[3..7], &250_000u32.to_be_bytes());
        assert_eq!(CanConfigPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn get_roundtrip() {
        let bytes = CanConfigPayload::Get.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(CanConfigPayload::decode(&bytes).unwrap(), CanConfigPayload::Get);
    }

    #[test]
    fn every_mode_roundtrips() {
        for mode in [
            CanMode::Normal,
            CanMode::ListenOnly,
            CanMode::Loopback,
            CanMode::ExtLoop,
        ] {
            let config = CanConfig {
                mode,
                ..CanConfig::default()
            };
            let bytes = CanConfigPayload::Set(config).encode();
            assert_eq!(
                CanConfigPayload::decode(&bytes).unwrap(),
                CanConfigPayload::Set(config)
            );
        }
    }

    #[test]
    fn rejects_unknown_mode_and_action() {
        let mut bytes = CanConfigPayload::Set(custom()).encode();
        bytes[13] = 9;
        assert!(matches!(
            CanConfigPayload::decode(&bytes),
            Err(RempError::UnknownValue { value: 9, .. })
        ));

        assert!(matches!(
            CanConfigPayload::decode(&[7, 0]),
            Err(RempError::UnknownValue { value: 7, .. })
        ));
    }

    #[test]
    fn rejects_truncated_set() {
        let bytes = CanConfigPayload::Set(custom()).encode();
        assert!(matches!(
            CanConfigPayload::decode(&bytes[..10]),
            Err(RempError::TooShort { .. })
        ));
    }
}
