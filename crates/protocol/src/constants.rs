use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version exchanged in `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// WebSocket path of the control channel.
pub const CONTROL_PATH: &str = "/agent/control";
/// WebSocket path of the data channel.
pub const DATA_PATH: &str = "/agent/data";

/// Time allowed to write a WebSocket message.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time to wait for a pong response (or any incoming message).
///
/// This acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Maximum message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default timeout for control-channel request/response operations.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often an agent sends `heartbeat`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time allowed for the `hello` handshake after the socket opens.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// The two sockets an agent keeps open to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Control,
    Data,
}

impl ChannelKind {
    pub fn path(self) -> &'static str {
        match self {
            Self::Control => CONTROL_PATH,
            Self::Data => DATA_PATH,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            CONTROL_PATH => Some(Self::Control),
            DATA_PATH => Some(Self::Data),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// Control channel message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Handshake
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "hello_ok")]
    HelloOk,
    #[serde(rename = "hello_error")]
    HelloError,

    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Requests from backend to agent, each with a result and an error reply
    #[serde(rename = "can_config_get")]
    CanConfigGet,
    #[serde(rename = "can_config_get_result")]
    CanConfigGetResult,
    #[serde(rename = "can_config_get_error")]
    CanConfigGetError,
    #[serde(rename = "can_config_set")]
    CanConfigSet,
    #[serde(rename = "can_config_set_result")]
    CanConfigSetResult,
    #[serde(rename = "can_config_set_error")]
    CanConfigSetError,
    #[serde(rename = "pairing_start")]
    PairingStart,
    #[serde(rename = "pairing_start_result")]
    PairingStartResult,
    #[serde(rename = "pairing_start_error")]
    PairingStartError,
    #[serde(rename = "pairing_submit")]
    PairingSubmit,
    #[serde(rename = "pairing_submit_result")]
    PairingSubmitResult,
    #[serde(rename = "pairing_submit_error")]
    PairingSubmitError,
    #[serde(rename = "cli_exec")]
    CliExec,
    #[serde(rename = "cli_exec_result")]
    CliExecResult,
    #[serde(rename = "cli_exec_error")]
    CliExecError,
    #[serde(rename = "command_exec")]
    CommandExec,
    #[serde(rename = "command_exec_ack")]
    CommandExecAck,
    #[serde(rename = "command_exec_error")]
    CommandExecError,

    // Agent-initiated
    #[serde(rename = "command_chunk")]
    CommandChunk,
    #[serde(rename = "command_response")]
    CommandResponse,
    #[serde(rename = "dongle_sighting")]
    DongleSighting,
    #[serde(rename = "dongle_lost")]
    DongleLost,
    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::HelloOk => "hello_ok",
            Self::HelloError => "hello_error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::CanConfigGet => "can_config_get",
            Self::CanConfigGetResult => "can_config_get_result",
            Self::CanConfigGetError => "can_config_get_error",
            Self::CanConfigSet => "can_config_set",
            Self::CanConfigSetResult => "can_config_set_result",
            Self::CanConfigSetError => "can_config_set_error",
            Self::PairingStart => "pairing_start",
            Self::PairingStartResult => "pairing_start_result",
            Self::PairingStartError => "pairing_start_error",
            Self::PairingSubmit => "pairing_submit",
            Self::PairingSubmitResult => "pairing_submit_result",
            Self::PairingSubmitError => "pairing_submit_error",
            Self::CliExec => "cli_exec",
            Self::CliExecResult => "cli_exec_result",
            Self::CliExecError => "cli_exec_error",
            Self::CommandExec => "command_exec",
            Self::CommandExecAck => "command_exec_ack",
            Self::CommandExecError => "command_exec_error",
            Self::CommandChunk => "command_chunk",
            Self::CommandResponse => "command_response",
            Self::DongleSighting => "dongle_sighting",
            Self::DongleLost => "dongle_lost",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Replies whose type ends in `error` reject the pending request.
    pub fn is_error(&self) -> bool {
        self.as_str().ends_with("error")
    }

    /// Success and failure reply types for a backend request.
    pub fn reply_types(&self) -> Option<(MessageType, MessageType)> {
        match self {
            Self::Ping => Some((Self::Pong, Self::Error)),
            Self::CanConfigGet => Some((Self::CanConfigGetResult, Self::CanConfigGetError)),
            Self::CanConfigSet => Some((Self::CanConfigSetResult, Self::CanConfigSetError)),
            Self::PairingStart => Some((Self::PairingStartResult, Self::PairingStartError)),
            Self::PairingSubmit => Some((Self::PairingSubmitResult, Self::PairingSubmitError)),
            Self::CliExec => Some((Self::CliExecResult, Self::CliExecError)),
            Self::CommandExec => Some((Self::CommandExecAck, Self::CommandExecError)),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::CanConfigGetResult).unwrap(),
            "\"can_config_get_result\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::HelloOk).unwrap(),
            "\"hello_ok\""
        );
    }

    #[test]
    fn as_str_matches_serde() {
        for t in [
            MessageType::Hello,
            MessageType::PairingSubmitError,
            MessageType::CommandChunk,
            MessageType::DongleSighting,
            MessageType::Error,
        ] {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"teleport\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn error_suffix() {
        assert!(MessageType::Error.is_error());
        assert!(MessageType::HelloError.is_error());
        assert!(MessageType::CliExecError.is_error());
        assert!(!MessageType::CliExecResult.is_error());
        assert!(!MessageType::Heartbeat.is_error());
    }

    #[test]
    fn reply_types_for_requests() {
        assert_eq!(
            MessageType::PairingStart.reply_types(),
            Some((
                MessageType::PairingStartResult,
                MessageType::PairingStartError
            ))
        );
        assert_eq!(MessageType::Heartbeat.reply_types(), None);
    }

    #[test]
    fn channel_paths() {
        assert_eq!(ChannelKind::from_path("/agent/control"), Some(ChannelKind::Control));
        assert_eq!(ChannelKind::from_path("/agent/data/"), Some(ChannelKind::Data));
        assert_eq!(ChannelKind::from_path("/ws"), None);
        assert_eq!(ChannelKind::Data.path(), DATA_PATH);
    }
}
