//! Pairing payload.
//!
//! ```text
//! common: [1: action][1: reserved / ack status][2: reserved][16: corr_id]
//! submit: common + [6: ASCII PIN][16: nonce][1: token_len][token]
//! ack:    common + [2 BE: seconds][0 or 16: nonce]
//! ```

use crate::RempError;
use crate::cli::CorrelationId;
use crate::cursor::Reader;
use crate::message::MAX_TOKEN_LEN;

const ACTION_START: u8 = 0;
const ACTION_SUBMIT: u8 = 1;
const ACTION_ACK: u8 = 2;

pub const PIN_LEN: usize = 6;
pub const NONCE_LEN: usize = 16;

pub type PairingNonce = [u8; NONCE_LEN];

/// Exactly six ASCII digits.
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == PIN_LEN && pin.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Ok,
    InvalidPin,
    Cooldown,
    Expired,
    NotArmed,
    Busy,
    Unknown(u8),
}

impl PairingStatus {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::InvalidPin => 1,
            Self::Cooldown => 2,
            Self::Expired => 3,
            Self::NotArmed => 4,
            Self::Busy => 5,
            Self::Unknown(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Ok,
            1 => Self::InvalidPin,
            2 => Self::Cooldown,
            3 => Self::Expired,
            4 => Self::NotArmed,
            5 => Self::Busy,
            other => Self::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::InvalidPin => "invalid_pin",
            Self::Cooldown => "cooldown",
            Self::Expired => "expired",
            Self::NotArmed => "not_armed",
            Self::Busy => "busy",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingPayload {
    Start {
        corr_id: CorrelationId,
    },
    Submit {
        corr_id: CorrelationId,
        pin: String,
        nonce: PairingNonce,
        token: Vec<u8>,
    },
    Ack {
        corr_id: CorrelationId,
        status: PairingStatus,
        seconds: u16,
        /// Empty or the 16-byte pairing nonce; other lengths are carried as
        /// received and left for the caller to reject.
        nonce: Vec<u8>,
    },
}

impl PairingPayload {
    pub fn corr_id(&self) -> &CorrelationId {
        match self {
            Self::Start { corr_id } | Self::Submit { corr_id, .. } | Self::Ack { corr_id, .. } => {
                corr_id
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RempError> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Self::Start { corr_id } => {
                buf.extend_from_slice(&[ACTION_START, 0, 0, 0]);
                buf.extend_from_slice(corr_id);
            }
            Self::Submit {
                corr_id,
                pin,
                nonce,
                token,
            } => {
                if !is_valid_pin(pin) {
                    return Err(RempError::InvalidPin);
                }
                if token.len() > MAX_TOKEN_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "pairing token",
                        len: token.len(),
                        max: MAX_TOKEN_LEN,
                    });
                }
                buf.extend_from_slice(&[ACTION_SUBMIT, 0, 0, 0]);
                buf.extend_from_slice(corr_id);
                buf.extend_from_slice(pin.as_bytes());
                buf.extend_from_slice(nonce);
                buf.push(token.len() as u8);
                buf.extend_from_slice(token);
            }
            Self::Ack {
                corr_id,
                status,
                seconds,
                nonce,
            } => {
                if nonce.len() > NONCE_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "pairing nonce",
                        len: nonce.len(),
                        max: NONCE_LEN,
                    });
                }
                buf.extend_from_slice(&[ACTION_ACK, status.to_byte(), 0, 0]);
                buf.extend_from_slice(corr_id);
                buf.extend_from_slice(&seconds.to_be_bytes());
                buf.extend_from_slice(nonce);
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RempError> {
        let mut r = Reader::new(buf);
        let action = r.u8()?;
        let status_byte = r.u8()?;
        r.skip(2)?;
        let corr_id: CorrelationId = r.array()?;

        match action {
            ACTION_START => Ok(Self::Start { corr_id }),
            ACTION_SUBMIT => {
                let pin_bytes = r.take(PIN_LEN)?;
                let pin = std::str::from_utf8(pin_bytes)
                    .map_err(|_| RempError::InvalidPin)?
                    .to_string();
                if !is_valid_pin(&pin) {
                    return Err(RempError::InvalidPin);
                }
                let nonce = r.array()?;
                let token_len = r.u8()? as usize;
                if token_len > MAX_TOKEN_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "pairing token",
                        len: token_len,
                        max: MAX_TOKEN_LEN,
                    });
                }
                let token = r.take(token_len)?.to_vec();
                Ok(Self::Submit {
                    corr_id,
                    pin,
                    nonce,
                    token,
                })
            }
            ACTION_ACK => {
                let seconds = r.u16()?;
                let nonce = r.rest();
                if nonce.len() > NONCE_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "pairing nonce",
                        len: nonce.len(),
                        max: NONCE_LEN,
                    });
                }
                Ok(Self::Ack {
                    corr_id,
                    status: PairingStatus::from_byte(status_byte),
                    seconds,
                    nonce: nonce.to_vec(),
                })
            }
            value => Err(RempError::UnknownValue {
                field: "pairing action",
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_validation() {
        assert!(is_valid_pin("012345"));
        assert!(!is_valid_pin("12345"));
        assert!(!is_valid_pin("1234567"));
        assert!(!is_valid_pin("12a456"));
        assert!(!is_valid_pin("１２３４５６"));
    }

    #[test]
    fn start_roundtrip() {
        let payload = PairingPayload::Start { corr_id: [1; 16] };
        let bytes = payload.encode().unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(PairingPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn submit_roundtrip() {
        let payload = PairingPayload::Submit {
            corr_id: [2; 16],
            pin: "424242".into(),
            nonce: [9; 16],
            token: vec![0xaa; 32],
        };
        let bytes = payload.encode().unwrap();
        assert_eq!(bytes.len(), 20 + 6 + 16 + 1 + 32);
        assert_eq!(&bytes[20..26], b"424242");
        assert_eq!(bytes[42], 32);
        assert_eq!(PairingPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn ack_roundtrip_with_and_without_nonce() {
        let with_nonce = PairingPayload::Ack {
            corr_id: [3; 16],
            status: PairingStatus::Ok,
            seconds: 90,
            nonce: vec![5; 16],
        };
        let bytes = with_nonce.encode().unwrap();
        assert_eq!(bytes.len(), 38);
        assert_eq!(PairingPayload::decode(&bytes).unwrap(), with_nonce);

        let cooldown = PairingPayload::Ack {
            corr_id: [3; 16],
            status: PairingStatus::Cooldown,
            seconds: 300,
            nonce: vec![],
        };
        let bytes = cooldown.encode().unwrap();
        assert_eq!(bytes[1], 2);
        assert_eq!(PairingPayload::decode(&bytes).unwrap(), cooldown);
    }

    #[test]
    fn unknown_status_is_preserved() {
        let payload = PairingPayload::Ack {
            corr_id: [0; 16],
            status: PairingStatus::Unknown(42),
            seconds: 0,
            nonce: vec![],
        };
        let bytes = payload.encode().unwrap();
        match PairingPayload::decode(&bytes).unwrap() {
            PairingPayload::Ack { status, .. } => assert_eq!(status, PairingStatus::Unknown(42)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_pin_and_long_token() {
        let bad_pin = PairingPayload::Submit {
            corr_id: [0; 16],
            pin: "12345x".into(),
            nonce: [0; 16],
            token: vec![],
        };
        assert_eq!(bad_pin.encode(), Err(RempError::InvalidPin));

        let long_token = PairingPayload::Submit {
            corr_id: [0; 16],
            pin: "123456".into(),
            nonce: [0; 16],
            token: vec![0; 65],
        };
        assert!(matches!(
            long_token.encode(),
            Err(RempError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn rejects_oversized_ack_nonce() {
        let mut bytes = PairingPayload::Ack {
            corr_id: [0; 16],
            status: PairingStatus::Ok,
            seconds: 1,
            nonce: vec![1; 16],
        }
        .encode()
        .unwrap();
        bytes.push(0);
        assert!(matches!(
            PairingPayload::decode(&bytes),
            Err(RempError::FieldTooLong { len: 17, .. })
        ));
    }
}
