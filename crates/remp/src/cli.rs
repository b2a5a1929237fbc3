//! Dongle CLI payload.
//!
//! ```text
//! request:  [1: action=0][1: dangerous][2: reserved][16: corr_id][2 BE: cmd_len][cmd]
//! response: [1: action=1][1: status][1: truncated][1: reserved][16: corr_id]
//!           [2 BE: exit_code (i16)][2 BE: out_len][output]
//! ```

use serde::{Deserialize, Serialize};

use crate::RempError;
use crate::cursor::Reader;

const ACTION_REQUEST: u8 = 0;
const ACTION_RESPONSE: u8 = 1;

pub const MAX_COMMAND_LEN: usize = 1024;
pub const MAX_OUTPUT_LEN: usize = u16::MAX as usize;

/// Opaque id that pairs a response with its request.
pub type CorrelationId = [u8; 16];

pub fn new_correlation_id() -> CorrelationId {
    uuid::Uuid::new_v4().into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliStatus {
    Ok,
    Denied,
    Error,
    Timeout,
}

impl CliStatus {
    fn to_byte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Denied => 1,
            Self::Error => 2,
            Self::Timeout => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self, RempError> {
        match b {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Denied),
            2 => Ok(Self::Error),
            3 => Ok(Self::Timeout),
            value => Err(RempError::UnknownValue {
                field: "CLI status",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliRequest {
    pub corr_id: CorrelationId,
    pub dangerous: bool,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliResponse {
    pub corr_id: CorrelationId,
    pub status: CliStatus,
    pub truncated: bool,
    pub exit_code: i16,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliPayload {
    Request(CliRequest),
    Response(CliResponse),
}

impl CliPayload {
    pub fn corr_id(&self) -> &CorrelationId {
        match self {
            Self::Request(req) => &req.corr_id,
            Self::Response(resp) => &resp.corr_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RempError> {
        match self {
            Self::Request(req) => {
                let cmd = req.command.as_bytes();
                if cmd.len() > MAX_COMMAND_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "CLI command",
                        len: cmd.len(),
                        max: MAX_COMMAND_LEN,
                    });
                }
                let mut buf = Vec::with_capacity(22 + cmd.len());
                buf.push(ACTION_REQUEST);
                buf.push(req.dangerous as u8);
                buf.extend_from_slice(&[0, 0]);
                buf.extend_from_slice(&req.corr_id);
                buf.extend_from_slice(&(cmd.len() as u16).to_be_bytes());
                buf.extend_from_slice(cmd);
                Ok(buf)
            }
            Self::Response(resp) => {
                if resp.output.len() > MAX_OUTPUT_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "CLI output",
                        len: resp.output.len(),
                        max: MAX_OUTPUT_LEN,
                    });
                }
                let mut buf = Vec::with_capacity(24 + resp.output.len());
                buf.push(ACTION_RESPONSE);
                buf.push(resp.status.to_byte());
                buf.push(resp.truncated as u8);
                buf.push(0);
                buf.extend_from_slice(&resp.corr_id);
                buf.extend_from_slice(&resp.exit_code.to_be_bytes());
                buf.extend_from_slice(&(resp.output.len() as u16).to_be_bytes());
                buf.extend_from_slice(&resp.output);
                Ok(buf)
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RempError> {
        let mut r = Reader::new(buf);
        match r.u8()? {
            ACTION_REQUEST => {
                let dangerous = r.u8()? != 0;
                r.skip(2)?;
                let corr_id = r.array()?;
                let len = r.u16()? as usize;
                if len > MAX_COMMAND_LEN {
                    return Err(RempError::FieldTooLong {
                        field: "CLI command",
                        len,
                        max: MAX_COMMAND_LEN,
                    });
                }
                let command = std::str::from_utf8(r.take(len)?)
                    .map_err(|_| RempError::InvalidUtf8("CLI command"))?
                    .to_string();
                Ok(Self::Request(CliRequest {
                    corr_id,
                    dangerous,
                    command,
                }))
            }
            ACTION_RESPONSE => {
                let status = CliStatus::from_byte(r.u8()?)?;
                let truncated = r.u8()? != 0;
                r.skip(1)?;
                let corr_id = r.array()?;
                let exit_code = i16::from_be_bytes(r.array()?);
                let len = r.u16()? as usize;
                let output = r.take(len)?.to_vec();
                Ok(Self::Response(CliResponse {
                    corr_id,
                    status,
                    truncated,
                    exit_code,
                    output,
                }))
            }
            value => Err(RempError::UnknownValue {
                field: "CLI action",
                value,
            }),
        }
    }
}
