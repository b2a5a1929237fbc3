//! Routing of inbound agent messages.

use std::sync::Arc;

use canbridge_protocol::messages::{
    CommandChunk, CommandResponse, DongleLostReport, DongleSightingReport, Heartbeat,
};
use canbridge_protocol::{ControlMessage, DataMessage, MessageType};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::commands::CommandTracker;
use crate::connection::Outbound;
use crate::hooks::AgentHooks;
use crate::manager::ConnectionManager;

/// Shared state every socket's read pump dispatches into.
pub(crate) struct Context {
    pub manager: Arc<ConnectionManager>,
    pub commands: CommandTracker,
    pub hooks: Arc<dyn AgentHooks>,
}

fn payload<T: DeserializeOwned>(agent_id: &str, msg: &ControlMessage) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(p)) => Some(p),
        Ok(None) => {
            debug!(agent = agent_id, msg_type = %msg.msg_type, "message without payload");
            None
        }
        Err(e) => {
            debug!(agent = agent_id, msg_type = %msg.msg_type, "bad payload: {e}");
            None
        }
    }
}

/// Handles one message from an agent's control channel.
pub(crate) async fn handle_incoming(
    ctx: &Arc<Context>,
    agent_id: &str,
    outbound: &Outbound,
    msg: ControlMessage,
) {
    use MessageType as T;

    match msg.msg_type {
        // Keepalive requested by the agent.
        T::Ping => {
            if let Ok(reply) = msg.reply::<()>(T::Pong, None) {
                let _ = outbound.send_msg(&reply);
            }
        }

        // Replies to backend requests.
        T::Pong
        | T::CanConfigGetResult
        | T::CanConfigGetError
        | T::CanConfigSetResult
        | T::CanConfigSetError
        | T::PairingStartResult
        | T::PairingStartError
        | T::PairingSubmitResult
        | T::PairingSubmitError
        | T::CliExecResult
        | T::CliExecError
        | T::CommandExecAck
        | T::CommandExecError => {
            if !ctx.manager.resolve(agent_id, msg) {
                debug!(agent = agent_id, "reply without a pending request");
            }
        }

        T::Error => {
            let error = msg.error.clone();
            if !ctx.manager.resolve(agent_id, msg) {
                warn!(agent = agent_id, error = ?error, "agent reported an error");
            }
        }

        // Agent-initiated reports.
        T::Heartbeat => {
            if let Some(hb) = payload::<Heartbeat>(agent_id, &msg) {
                ctx.hooks.on_heartbeat(agent_id, hb).await;
            }
        }
        T::CommandChunk => {
            if let Some(chunk) = payload::<CommandChunk>(agent_id, &msg) {
                ctx.commands.on_chunk(agent_id, &chunk);
            }
        }
        T::CommandResponse => {
            if let Some(resp) = payload::<CommandResponse>(agent_id, &msg) {
                ctx.commands.on_response(agent_id, &resp);
            }
        }
        T::DongleSighting => {
            if let Some(report) = payload::<DongleSightingReport>(agent_id, &msg) {
                ctx.hooks.on_sighting(agent_id, report).await;
            }
        }
        T::DongleLost => {
            if let Some(report) = payload::<DongleLostReport>(agent_id, &msg) {
                ctx.hooks.on_dongle_lost(agent_id, report).await;
            }
        }

        // Handshake messages are only valid as the first frame.
        T::Hello | T::HelloOk | T::HelloError => {
            warn!(agent = agent_id, msg_type = %msg.msg_type, "handshake message after handshake");
        }

        // Requests only the backend sends.
        T::CanConfigGet
        | T::CanConfigSet
        | T::PairingStart
        | T::PairingSubmit
        | T::CliExec
        | T::CommandExec => {
            warn!(agent = agent_id, msg_type = %msg.msg_type, "agent sent a backend-only request");
            let _ = outbound.send_msg(&msg.reply_error(T::Error, "not accepted from agents"));
        }

        T::Unknown => {
            warn!(agent = agent_id, "unknown message type");
            let _ = outbound.send_msg(&msg.reply_error(T::Error, "unknown message type"));
        }
    }
}

/// Handles one message from an agent's data channel.
pub(crate) async fn handle_data(ctx: &Arc<Context>, agent_id: &str, msg: DataMessage) {
    match msg {
        DataMessage::CanFrame(frame) => ctx.hooks.on_frame(agent_id, frame).await,
        DataMessage::Unknown => debug!(agent = agent_id, "unknown data message"),
    }
}
