//! Relay and pairing collaborators backed by the agent channels.

use std::sync::Arc;

use canbridge_control::{ConnectionManager, ControlError};
use canbridge_pairing::{DeviceReply, LinkError, LinkFuture, PairingLink};
use canbridge_protocol::messages::{AckStatus, PairingAck, PairingStartRequest, PairingSubmitRequest};
use canbridge_protocol::{CanFrameRelay, DataMessage, MessageType};
use canbridge_relay::{DataLink, RelayError};
use tracing::trace;

use crate::directory::DongleDirectory;

/// Delivers relayed frames on the destination agent's data socket.
pub struct ControlDataLink {
    manager: Arc<ConnectionManager>,
}

impl ControlDataLink {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

impl DataLink for ControlDataLink {
    fn send_frame(&self, agent_id: &str, frame: &CanFrameRelay) -> Result<(), RelayError> {
        self.manager
            .send_data(agent_id, &DataMessage::CanFrame(frame.clone()))
            .map_err(|e| {
                trace!(agent = agent_id, error = %e, "data send failed");
                RelayError::LinkDown(agent_id.to_string())
            })
    }
}

/// Runs pairing requests on the agent that serves the dongle.
pub struct ControlPairingLink {
    manager: Arc<ConnectionManager>,
    directory: Arc<DongleDirectory>,
}

impl ControlPairingLink {
    pub fn new(manager: Arc<ConnectionManager>, directory: Arc<DongleDirectory>) -> Self {
        Self { manager, directory }
    }

    fn agent(&self, dongle_id: &str) -> Result<String, LinkError> {
        self.directory
            .agent_for(dongle_id)
            .ok_or_else(|| LinkError(format!("no agent serves dongle {dongle_id}")))
    }
}

impl PairingLink for ControlPairingLink {
    fn start<'a>(&'a self, dongle_id: &'a str) -> LinkFuture<'a> {
        Box::pin(async move {
            let agent = self.agent(dongle_id)?;
            let req = PairingStartRequest {
                dongle_id: dongle_id.to_string(),
            };
            let ack: PairingAck = self
                .manager
                .call(&agent, MessageType::PairingStart, &req)
                .await
                .map_err(unreachable)?;
            Ok(device_reply(&ack))
        })
    }

    fn submit<'a>(
        &'a self,
        dongle_id: &'a str,
        pin: &'a str,
        nonce: [u8; 16],
        secret: &'a [u8],
    ) -> LinkFuture<'a> {
        Box::pin(async move {
            let agent = self.agent(dongle_id)?;
            let req = PairingSubmitRequest {
                dongle_id: dongle_id.to_string(),
                pin: pin.to_string(),
                nonce: hex::encode(nonce),
                token: secret.to_vec(),
            };
            let ack: PairingAck = self
                .manager
                .call(&agent, MessageType::PairingSubmit, &req)
                .await
                .map_err(unreachable)?;
            Ok(device_reply(&ack))
        })
    }
}

fn unreachable(e: ControlError) -> LinkError {
    LinkError(e.to_string())
}

fn device_reply(ack: &PairingAck) -> DeviceReply {
    match ack.status {
        AckStatus::Ok => DeviceReply::Ok {
            seconds: ack.seconds,
            nonce: ack.nonce_bytes().unwrap_or_default(),
        },
        AckStatus::InvalidPin => DeviceReply::InvalidPin,
        AckStatus::Cooldown => DeviceReply::Cooldown {
            seconds: ack.seconds,
        },
        AckStatus::Expired => DeviceReply::Expired,
        AckStatus::NotArmed => DeviceReply::Rejected("not_armed".into()),
        AckStatus::Busy => DeviceReply::Rejected("busy".into()),
        AckStatus::Unknown => DeviceReply::Rejected("unknown".into()),
    }
}
