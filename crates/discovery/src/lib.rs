pub mod codec;
pub mod net;
pub mod scanner;

// Re-export primary types.
pub use codec::{
    AnnouncePayload, HeaderVariant, LEGACY_HEADER_LEN, HEADER_LEN, MAGIC, Packet, PacketType,
    PairingState, VERSION,
};
pub use net::{broadcast_targets, local_ipv4s};
pub use scanner::{DEFAULT_PORT, DiscoveryEvent, EventType, Scanner, ScannerConfig, Sighting};

/// Errors for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("packet too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported discovery version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),

    #[error("unsupported header length {0}")]
    BadHeaderLen(u8),

    #[error("datagram length {got} does not match header + payload ({expected})")]
    LengthMismatch { expected: usize, got: usize },

    #[error("CRC mismatch: header says {expected:08x}, computed {computed:08x}")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("TLV record truncated at offset {0}")]
    TruncatedTlv(usize),

    #[error("TLV 0x{tlv:02x} has length {len}, expected {expected}")]
    BadTlvLength { tlv: u8, len: usize, expected: usize },

    #[error("sequence {0} does not fit a legacy header")]
    SeqOutOfRange(u32),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}
