//! Backend side of the agent channels.
//!
//! Each agent keeps two WebSockets open to the backend: a control channel
//! carrying correlated requests and agent reports, and a data channel
//! carrying relayed CAN frames. [`ConnectionManager`] owns the live sockets
//! and pending requests, [`CommandTracker`] follows host commands that run
//! longer than one round trip, and [`ControlServer`] accepts the sockets.

mod commands;
mod connection;
mod dispatch;
mod hooks;
mod manager;
mod server;

pub use commands::{CommandAllowlist, CommandPolicy, CommandRecord, CommandStatus, CommandTracker};
pub use connection::{Outbound, SEND_BUFFER_SIZE};
pub use hooks::{AgentAuthenticator, AgentHooks, AuthFuture, HookFuture, NoHooks, StaticTokens};
pub use manager::ConnectionManager;
pub use server::{ControlServer, ServerConfig};

use canbridge_protocol::MessageType;

/// Errors produced by the control layer.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("agent {0} is not connected")]
    AgentOffline(String),

    #[error("request timed out")]
    Timeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("send buffer full or connection closed")]
    SendFailed,

    #[error("{msg_type}: {message}")]
    Remote {
        msg_type: MessageType,
        message: String,
    },

    #[error("reply carried no payload")]
    MissingPayload,

    #[error("command {0:?} is not allowed")]
    CommandNotAllowed(String),

    #[error("command {command:?} takes at most {max} arguments, got {got}")]
    TooManyArgs {
        command: String,
        max: usize,
        got: usize,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl ControlError {
    /// Whether the failure means the agent could not be reached, as opposed
    /// to a local validation or encoding problem.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::AgentOffline(_)
                | Self::Timeout
                | Self::ChannelClosed
                | Self::SendFailed
                | Self::Remote { .. }
        )
    }
}
