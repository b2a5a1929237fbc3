//! Discovery datagram codec.
//!
//! ```text
//! [4: magic "RDSC"][1: version][1: type][1: reserved][1: header_len]
//! [2 LE: payload_len][2 or 4 LE: seq][4 LE: crc32][payload]
//! ```
//!
//! The legacy header (16 bytes) carries a 16-bit sequence, the current one
//! (18 bytes) a 32-bit sequence. The CRC covers the header with the CRC field
//! zeroed, followed by the payload. ANNOUNCE payloads are TLV records
//! `[1: type][1: len][len: value]`.

use std::net::Ipv4Addr;

use canbridge_remp::DeviceId;
use serde::{Deserialize, Serialize};

use crate::DiscoveryError;

pub const MAGIC: [u8; 4] = *b"RDSC";
pub const VERSION: u8 = 1;
pub const LEGACY_HEADER_LEN: usize = 16;
pub const HEADER_LEN: usize = 18;

const TYPE_DISCOVER: u8 = 0x01;
const TYPE_ANNOUNCE: u8 = 0x02;

const TLV_DEVICE_ID: u8 = 0x01;
const TLV_FW_BUILD: u8 = 0x02;
const TLV_UDP_PORT: u8 = 0x03;
const TLV_CAPABILITIES: u8 = 0x04;
const TLV_PROTO_VER: u8 = 0x05;
const TLV_LAN_IP: u8 = 0x06;
const TLV_PAIRING_STATE: u8 = 0x07;
const TLV_PAIRING_NONCE: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Discover,
    Announce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVariant {
    /// 16-byte header with a 16-bit sequence, sent by older firmware.
    Legacy,
    Current,
}

impl HeaderVariant {
    pub fn header_len(self) -> usize {
        match self {
            Self::Legacy => LEGACY_HEADER_LEN,
            Self::Current => HEADER_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Unpaired,
    Armed,
    Paired,
    Hold,
    Unknown(u8),
}

impl PairingState {
    fn to_byte(self) -> u8 {
        match self {
            Self::Unpaired => 0,
            Self::Armed => 1,
            Self::Paired => 2,
            Self::Hold => 3,
            Self::Unknown(b) => b,
        }
    }

    fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Unpaired,
            1 => Self::Armed,
            2 => Self::Paired,
            3 => Self::Hold,
            other => Self::Unknown(other),
        }
    }
}

/// ANNOUNCE fields. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub device_id: Option<DeviceId>,
    pub fw_build: Option<u16>,
    pub udp_port: Option<u16>,
    pub capabilities: Option<u32>,
    pub proto_ver: Option<u8>,
    pub lan_ip: Option<Ipv4Addr>,
    pub pairing_state: Option<PairingState>,
    pub pairing_nonce: Option<[u8; 16]>,
}

impl AnnouncePayload {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut put = |tlv: u8, value: &[u8]| {
            buf.push(tlv);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        };
        if let Some(id) = &self.device_id {
            put(TLV_DEVICE_ID, id);
        }
        if let Some(fw) = self.fw_build {
            put(TLV_FW_BUILD, &fw.to_le_bytes());
        }
        if let Some(port) = self.udp_port {
            put(TLV_UDP_PORT, &port.to_le_bytes());
        }
        if let Some(caps) = self.capabilities {
            put(TLV_CAPABILITIES, &caps.to_le_bytes());
        }
        if let Some(ver) = self.proto_ver {
            put(TLV_PROTO_VER, &[ver]);
        }
        if let Some(ip) = self.lan_ip {
            put(TLV_LAN_IP, &ip.octets());
        }
        if let Some(state) = self.pairing_state {
            put(TLV_PAIRING_STATE, &[state.to_byte()]);
        }
        if let Some(nonce) = &self.pairing_nonce {
            put(TLV_PAIRING_NONCE, nonce);
        }
        buf
    }

    fn decode(payload: &[u8]) -> Result<Self, DiscoveryError> {
        let mut out = Self::default();
        let mut pos = 0;
        while pos < payload.len() {
            if payload.len() - pos < 2 {
                return Err(DiscoveryError::TruncatedTlv(pos));
            }
            let tlv = payload[pos];
            let len = payload[pos + 1] as usize;
            let start = pos + 2;
            let end = start + len;
            if end > payload.len() {
                return Err(DiscoveryError::TruncatedTlv(pos));
            }
            let value = &payload[start..end];

            match tlv {
                TLV_DEVICE_ID => out.device_id = Some(fixed(tlv, value)?),
                TLV_FW_BUILD => out.fw_build = Some(u16::from_le_bytes(fixed(tlv, value)?)),
                TLV_UDP_PORT => out.udp_port = Some(u16::from_le_bytes(fixed(tlv, value)?)),
                TLV_CAPABILITIES => {
                    out.capabilities = Some(u32::from_le_bytes(fixed(tlv, value)?))
                }
                TLV_PROTO_VER => out.proto_ver = Some(fixed::<1>(tlv, value)?[0]),
                TLV_LAN_IP => out.lan_ip = Some(Ipv4Addr::from(fixed::<4>(tlv, value)?)),
                TLV_PAIRING_STATE => {
                    out.pairing_state = Some(PairingState::from_byte(fixed::<1>(tlv, value)?[0]))
                }
                TLV_PAIRING_NONCE => out.pairing_nonce = Some(fixed(tlv, value)?),
                // Newer firmware may add fields we do not know yet.
                _ => {}
            }
            pos = end;
        }
        Ok(out)
    }
}

fn fixed<const N: usize>(tlv: u8, value: &[u8]) -> Result<[u8; N], DiscoveryError> {
    value.try_into().map_err(|_| DiscoveryError::BadTlvLength {
        tlv,
        len: value.len(),
        expected: N,
    })
}

/// A decoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub variant: HeaderVariant,
    pub seq: u32,
    /// Empty for DISCOVER.
    pub announce: AnnouncePayload,
}

impl Packet {
    pub fn discover(seq: u32) -> Self {
        Self {
            packet_type: PacketType::Discover,
            variant: HeaderVariant::Current,
            seq,
            announce: AnnouncePayload::default(),
        }
    }

    pub fn announce(seq: u32, announce: AnnouncePayload) -> Self {
        Self {
            packet_type: PacketType::Announce,
            variant: HeaderVariant::Current,
            seq,
            announce,
        }
    }

    pub fn with_variant(mut self, variant: HeaderVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        let payload = match self.packet_type {
            PacketType::Discover => Vec::new(),
            PacketType::Announce => self.announce.encode(),
        };
        if payload.len() > u16::MAX as usize {
            return Err(DiscoveryError::PayloadTooLarge(payload.len()));
        }

        let header_len = self.variant.header_len();
        let mut buf = Vec::with_capacity(header_len + payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.push(match self.packet_type {
            PacketType::Discover => TYPE_DISCOVER,
            PacketType::Announce => TYPE_ANNOUNCE,
        });
        buf.push(0);
        buf.push(header_len as u8);
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        match self.variant {
            HeaderVariant::Legacy => {
                let seq =
                    u16::try_from(self.seq).map_err(|_| DiscoveryError::SeqOutOfRange(self.seq))?;
                buf.extend_from_slice(&seq.to_le_bytes());
            }
            HeaderVariant::Current => buf.extend_from_slice(&self.seq.to_le_bytes()),
        }
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&payload);

        let crc = crc32fast::hash(&buf);
        buf[header_len - 4..header_len].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DiscoveryError> {
        if buf.len() < LEGACY_HEADER_LEN {
            return Err(DiscoveryError::TooShort {
                need: LEGACY_HEADER_LEN,
                got: buf.len(),
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != MAGIC {
            return Err(DiscoveryError::BadMagic(magic));
        }
        if buf[4] != VERSION {
            return Err(DiscoveryError::UnsupportedVersion(buf[4]));
        }
        let packet_type = match buf[5] {
            TYPE_DISCOVER => PacketType::Discover,
            TYPE_ANNOUNCE => PacketType::Announce,
            other => return Err(DiscoveryError::UnknownType(other)),
        };
        let variant = match buf[7] as usize {
            LEGACY_HEADER_LEN => HeaderVariant::Legacy,
            HEADER_LEN => HeaderVariant::Current,
            _ => return Err(DiscoveryError::BadHeaderLen(buf[7])),
        };
        let header_len = variant.header_len();
        if buf.len() < header_len {
            return Err(DiscoveryError::TooShort {
                need: header_len,
                got: buf.len(),
            });
        }

        let payload_len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
        if buf.len() != header_len + payload_len {
            return Err(DiscoveryError::LengthMismatch {
                expected: header_len + payload_len,
                got: buf.len(),
            });
        }

        let seq = match variant {
            HeaderVariant::Legacy => u16::from_le_bytes([buf[10], buf[11]]) as u32,
            HeaderVariant::Current => u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        };

        let crc_at = header_len - 4;
        let expected = u32::from_le_bytes([
            buf[crc_at],
            buf[crc_at + 1],
            buf[crc_at + 2],
            buf[crc_at + 3],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..crc_at]);
        hasher.update(&[0; 4]);
        hasher.update(&buf[header_len..]);
        let computed = hasher.finalize();
        if computed != expected {
            return Err(DiscoveryError::CrcMismatch { expected, computed });
        }

        let announce = match packet_type {
            PacketType::Discover => AnnouncePayload::default(),
            PacketType::Announce => AnnouncePayload::decode(&buf[header_len..])?,
        };

        Ok(Self {
            packet_type,
            variant,
            seq,
            announce,
        })
    }
}
