//! Control-channel dispatch on the agent.

use std::sync::Arc;
use std::time::Instant;

use canbridge_protocol::messages::{
    CanConfigGetRequest, CanConfigResult, CanConfigSetRequest, CliExecRequest, CliExecResult,
    CommandExecAck, CommandExecRequest, Heartbeat, PairingAck, PairingStartRequest,
    PairingSubmitRequest,
};
use canbridge_protocol::{ControlMessage, MessageType};
use canbridge_remp::{PairingNonce, PairingStatus};
use canbridge_transport::{DongleClient, PairingReply, TransportError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tracing::{debug, warn};

use crate::client::{ChannelHandler, HandlerFuture, Uplink};
use crate::dongles::DongleRegistry;
use crate::runner::CommandRunner;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("dongle {0} is not visible to this agent")]
    UnknownDongle(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Command(String),

    #[error("{0} is not a request")]
    NotARequest(MessageType),
}

/// Handles requests arriving on the control channel.
#[derive(Clone)]
pub struct ControlHandler {
    registry: Arc<DongleRegistry>,
    runner: Arc<CommandRunner>,
    uplink: Uplink,
    started: Instant,
}

impl ControlHandler {
    pub fn new(registry: Arc<DongleRegistry>, runner: Arc<CommandRunner>, uplink: Uplink) -> Self {
        Self {
            registry,
            runner,
            uplink,
            started: Instant::now(),
        }
    }

    fn client(&self, dongle_id: &str) -> Result<DongleClient, HandlerError> {
        self.registry
            .client(dongle_id)
            .ok_or_else(|| HandlerError::UnknownDongle(dongle_id.to_string()))
    }

    /// Runs a backend request and sends the matching result or error reply.
    async fn respond(&self, msg: ControlMessage) {
        let Some((ok_type, err_type)) = msg.msg_type.reply_types() else {
            return;
        };
        let reply = match self.execute(&msg).await {
            Ok(payload) => ControlMessage {
                msg_type: ok_type,
                request_id: msg.request_id.clone(),
                payload: Some(payload),
                error: None,
            },
            Err(e) => {
                debug!(msg_type = %msg.msg_type, "request failed: {e}");
                msg.reply_error(err_type, e.to_string())
            }
        };
        self.uplink.send_msg(&reply);
    }

    async fn execute(&self, msg: &ControlMessage) -> Result<Box<RawValue>, HandlerError> {
        use MessageType as T;

        match msg.msg_type {
            T::CanConfigGet => {
                let req: CanConfigGetRequest = parse(msg)?;
                let (status, config) = self.client(&req.dongle_id)?.get_config().await?;
                raw(&CanConfigResult {
                    dongle_id: req.dongle_id,
                    status,
                    config,
                })
            }
            T::CanConfigSet => {
                let req: CanConfigSetRequest = parse(msg)?;
                let (status, config) = self
                    .client(&req.dongle_id)?
                    .set_config(req.config)
                    .await?;
                raw(&CanConfigResult {
                    dongle_id: req.dongle_id,
                    status,
                    config,
                })
            }
            T::PairingStart => {
                let req: PairingStartRequest = parse(msg)?;
                let reply = self.client(&req.dongle_id)?.pairing_start().await?;
                raw(&ack(req.dongle_id, reply))
            }
            T::PairingSubmit => {
                let req: PairingSubmitRequest = parse(msg)?;
                let nonce: PairingNonce = hex::decode(&req.nonce)
                    .ok()
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| HandlerError::BadRequest("nonce must be 16 hex bytes".into()))?;
                let reply = self
                    .client(&req.dongle_id)?
                    .pairing_submit(&req.pin, nonce, req.token.clone())
                    .await?;
                if reply.status == PairingStatus::Ok {
                    self.registry.set_token(&req.dongle_id, req.token);
                }
                raw(&ack(req.dongle_id, reply))
            }
            T::CliExec => {
                let req: CliExecRequest = parse(msg)?;
                let resp = self
                    .client(&req.dongle_id)?
                    .cli(&req.command, req.dangerous)
                    .await?;
                raw(&CliExecResult {
                    dongle_id: req.dongle_id,
                    status: resp.status,
                    exit_code: resp.exit_code,
                    truncated: resp.truncated,
                    output: String::from_utf8_lossy(&resp.output).into_owned(),
                })
            }
            T::CommandExec => {
                let req: CommandExecRequest = parse(msg)?;
                self.runner.start(&req, self.uplink.clone())?;
                raw(&CommandExecAck {
                    command_id: req.command_id,
                })
            }
            other => Err(HandlerError::NotARequest(other)),
        }
    }

    fn heartbeat_message(&self) -> Option<ControlMessage> {
        let hb = Heartbeat {
            uptime_secs: self.started.elapsed().as_secs(),
            dongles: self.registry.ids(),
        };
        ControlMessage::new(MessageType::Heartbeat, Some(&hb)).ok()
    }
}

impl ChannelHandler for ControlHandler {
    fn on_connected(&self) {
        // The backend forgets sightings when the channel drops.
        for report in self.registry.reports() {
            if let Ok(msg) = ControlMessage::new(MessageType::DongleSighting, Some(&report)) {
                self.uplink.send_msg(&msg);
            }
        }
    }

    fn on_text<'a>(&'a self, text: String) -> HandlerFuture<'a> {
        Box::pin(async move {
            let msg = match ControlMessage::from_json(&text) {
                Ok(m) => m,
                Err(e) => {
                    debug!("invalid control message: {e}");
                    return;
                }
            };

            use MessageType as T;
            match msg.msg_type {
                T::Ping => {
                    if let Ok(pong) = msg.reply::<()>(T::Pong, None) {
                        self.uplink.send_msg(&pong);
                    }
                }

                // Device and host requests can take seconds; keep reading.
                T::CanConfigGet
                | T::CanConfigSet
                | T::PairingStart
                | T::PairingSubmit
                | T::CliExec
                | T::CommandExec => {
                    let this = self.clone();
                    tokio::spawn(async move { this.respond(msg).await });
                }

                T::Pong => {}

                T::Error => warn!(error = ?msg.error, "backend reported an error"),

                T::Hello | T::HelloOk | T::HelloError => {
                    warn!(msg_type = %msg.msg_type, "handshake message after handshake");
                }

                // Replies and reports only ever flow agent -> backend.
                T::CanConfigGetResult
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
                | T::CommandExecError
                | T::CommandChunk
                | T::CommandResponse
                | T::DongleSighting
                | T::DongleLost
                | T::Heartbeat => {
                    debug!(msg_type = %msg.msg_type, "ignoring agent-bound message type");
                }

                T::Unknown => {
                    self.uplink
                        .send_msg(&msg.reply_error(T::Error, "unknown message type"));
                }
            }
        })
    }

    fn heartbeat(&self) -> Option<String> {
        self.heartbeat_message().and_then(|m| m.to_json().ok())
    }
}

fn parse<T: DeserializeOwned>(msg: &ControlMessage) -> Result<T, HandlerError> {
    msg.parse_payload()?
        .ok_or_else(|| HandlerError::BadRequest(format!("{} without payload", msg.msg_type)))
}

fn raw<T: Serialize>(value: &T) -> Result<Box<RawValue>, HandlerError> {
    Ok(serde_json::value::to_raw_value(value)?)
}

fn ack(dongle_id: String, reply: PairingReply) -> PairingAck {
    PairingAck {
        dongle_id,
        status: reply.status.into(),
        seconds: reply.seconds,
        nonce: (!reply.nonce.is_empty()).then(|| hex::encode(&reply.nonce)),
    }
}
