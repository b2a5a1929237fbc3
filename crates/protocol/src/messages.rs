use std::net::Ipv4Addr;

use canbridge_discovery::PairingState;
use canbridge_remp::{CanConfig, CliStatus, ConfigStatus, PairingStatus};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First message an agent sends on either socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub agent_id: String,
    pub token: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    pub version: u32,
}

// ---------------------------------------------------------------------------
// Device operations (backend -> agent)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfigGetRequest {
    pub dongle_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfigSetRequest {
    pub dongle_id: String,
    pub config: CanConfig,
}

/// Reply to both `can_config_get` and `can_config_set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfigResult {
    pub dongle_id: String,
    pub status: ConfigStatus,
    pub config: CanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingStartRequest {
    pub dongle_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingSubmitRequest {
    pub dongle_id: String,
    pub pin: String,
    /// Hex-encoded 16-byte pairing nonce.
    pub nonce: String,
    /// Device-scoped secret handed to the dongle on success, base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub token: Vec<u8>,
}

/// Device-reported pairing status as carried over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    InvalidPin,
    Cooldown,
    Expired,
    NotArmed,
    Busy,
    #[serde(other)]
    Unknown,
}

impl From<PairingStatus> for AckStatus {
    fn from(status: PairingStatus) -> Self {
        match status {
            PairingStatus::Ok => Self::Ok,
            PairingStatus::InvalidPin => Self::InvalidPin,
            PairingStatus::Cooldown => Self::Cooldown,
            PairingStatus::Expired => Self::Expired,
            PairingStatus::NotArmed => Self::NotArmed,
            PairingStatus::Busy => Self::Busy,
            PairingStatus::Unknown(_) => Self::Unknown,
        }
    }
}

/// Reply to both `pairing_start` and `pairing_submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingAck {
    pub dongle_id: String,
    pub status: AckStatus,
    /// Cooldown or expiry seconds, depending on `status`.
    #[serde(default)]
    pub seconds: u16,
    /// Hex-encoded pairing nonce when the device sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl PairingAck {
    /// Raw nonce bytes, if present and valid hex.
    pub fn nonce_bytes(&self) -> Option<Vec<u8>> {
        self.nonce.as_deref().and_then(|n| hex::decode(n).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliExecRequest {
    pub dongle_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dangerous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliExecResult {
    pub dongle_id: String,
    pub status: CliStatus,
    pub exit_code: i16,
    #[serde(default, skip_serializing_if = "is_false")]
    pub truncated: bool,
    pub output: String,
}

// ---------------------------------------------------------------------------
// Command execution on the agent host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecRequest {
    pub command_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecAck {
    pub command_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandChunk {
    pub command_id: String,
    pub stream: OutputStream,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Terminal message for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub outcome: CommandOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Agent reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DongleSightingReport {
    pub dongle_id: String,
    /// Endpoint the agent uses for REMP traffic.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_build: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto_ver: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_state: Option<PairingState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DongleLostReport {
    pub dongle_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uptime_secs: u64,
    #[serde(default)]
    pub dongles: Vec<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_token_is_base64() {
        let req = PairingSubmitRequest {
            dongle_id: "0102030405060708".into(),
            pin: "123456".into(),
            nonce: "00".repeat(16),
            token: b"Hello".to_vec(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("SGVsbG8="));
        let parsed: PairingSubmitRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.token, b"Hello");
    }

    #[test]
    fn ack_status_maps_and_tolerates_unknown() {
        assert_eq!(AckStatus::from(PairingStatus::Cooldown), AckStatus::Cooldown);
        assert_eq!(AckStatus::from(PairingStatus::Unknown(77)), AckStatus::Unknown);

        let ack: PairingAck =
            serde_json::from_str(r#"{"dongle_id":"d","status":"melted"}"#).unwrap();
        assert_eq!(ack.status, AckStatus::Unknown);
        assert_eq!(ack.seconds, 0);
        assert!(ack.nonce_bytes().is_none());
    }

    #[test]
    fn ack_nonce_bytes() {
        let ack = PairingAck {
            dongle_id: "d".into(),
            status: AckStatus::Ok,
            seconds: 60,
            nonce: Some("ab".repeat(16)),
        };
        assert_eq!(ack.nonce_bytes().unwrap(), vec![0xab; 16]);
    }

    #[test]
    fn cli_exec_omits_false_flags() {
        let req = CliExecRequest {
            dongle_id: "d".into(),
            command: "status".into(),
            dangerous: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("dangerous"));
    }

    #[test]
    fn command_response_shape() {
        let resp = CommandResponse {
            command_id: "c1".into(),
            outcome: CommandOutcome::TimedOut,
            exit_code: None,
            error: None,
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, serde_json::json!({"command_id": "c1", "outcome": "timed_out"}));
    }

    #[test]
    fn config_result_roundtrip() {
        let res = CanConfigResult {
            dongle_id: "d".into(),
            status: ConfigStatus::Invalid,
            config: CanConfig::default(),
        };
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"invalid\""));
        assert!(json.contains("\"normal\""));
        let back: CanConfigResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, res);
    }

    #[test]
    fn sighting_omits_unknown_fields() {
        let report = DongleSightingReport {
            dongle_id: "d".into(),
            address: "10.0.0.2:9000".into(),
            fw_build: None,
            capabilities: None,
            proto_ver: None,
            lan_ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
            pairing_state: Some(PairingState::Armed),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["lan_ip"], "10.0.0.2");
        assert_eq!(json["pairing_state"], "armed");
        assert!(json.get("fw_build").is_none());
    }
}
