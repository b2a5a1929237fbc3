//! CAN frame payload.
//!
//! ```text
//! [4 BE: can_id, top bit = extended][1: flags][1: dlc][2: reserved][dlc bytes]
//! ```

use serde::{Deserialize, Serialize};

use crate::RempError;
use crate::cursor::Reader;

pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;
pub const MAX_DLC: usize = 8;

const FLAG_SIMULATED: u8 = 0x01;
const FLAG_LOOPBACK: u8 = 0x02;
const FIXED_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub can_id: u32,
    #[serde(rename = "is_extended", default)]
    pub extended: bool,
    pub data: Vec<u8>,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default)]
    pub loopback: bool,
}

impl CanFrame {
    /// Builds a frame, rejecting ids and payloads that cannot go on the bus.
    pub fn new(can_id: u32, extended: bool, data: Vec<u8>) -> Result<Self, RempError> {
        let frame = Self {
            can_id,
            extended,
            data,
            simulated: false,
            loopback: false,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }

    pub fn validate(&self) -> Result<(), RempError> {
        let max = if self.extended {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        if self.can_id > max {
            return Err(RempError::CanIdOutOfRange {
                id: self.can_id,
                extended: self.extended,
            });
        }
        if self.data.len() > MAX_DLC {
            return Err(RempError::FieldTooLong {
                field: "CAN data",
                len: self.data.len(),
                max: MAX_DLC,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, RempError> {
        self.validate()?;

        let raw_id = if self.extended {
            self.can_id | CAN_EFF_FLAG
        } else {
            self.can_id
        };
        let mut flags = 0u8;
        if self.simulated {
            flags |= FLAG_SIMULATED;
        }
        if self.loopback {
            flags |= FLAG_LOOPBACK;
        }

        let mut buf = Vec::with_capacity(FIXED_LEN + self.data.len());
        buf.extend_from_slice(&raw_id.to_be_bytes());
        buf.push(flags);
        buf.push(self.dlc());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RempError> {
        let mut r = Reader::new(buf);
        let raw_id = r.u32()?;
        let flags = r.u8()?;
        let dlc = r.u8()? as usize;
        r.skip(2)?;
        if dlc > MAX_DLC {
            return Err(RempError::FieldTooLong {
                field: "CAN dlc",
                len: dlc,
                max: MAX_DLC,
            });
        }
        let data = r.take(dlc)?.to_vec();

        let extended = raw_id & CAN_EFF_FLAG != 0;
        let can_id = if extended {
            raw_id & CAN_EFF_MASK
        } else {
            raw_id & CAN_SFF_MASK
        };

        Ok(Self {
            can_id,
            extended,
            data,
            simulated: flags & FLAG_SIMULATED != 0,
            loopback: flags & FLAG_LOOPBACK != 0,
        })
    }
}
