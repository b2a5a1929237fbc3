use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canbridge_remp::{
    CanConfig, CanConfigPayload, CanFrame, CliPayload, CliRequest, CliResponse, ConfigStatus,
    DeviceId, MessageType, PairingNonce, PairingPayload, PairingStatus, RempMessage,
    message::FLAG_ACK_REQUESTED, new_correlation_id,
};
use tracing::debug;

use crate::matchers;
use crate::{DongleTransport, TransportError};

/// Default time to wait for a dongle reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// The device's answer to a pairing start or submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingReply {
    pub status: PairingStatus,
    pub seconds: u16,
    pub nonce: Vec<u8>,
}

/// Typed operations against one dongle.
#[derive(Clone)]
pub struct DongleClient {
    transport: Arc<DongleTransport>,
    device_id: DeviceId,
    addr: SocketAddr,
    token: Vec<u8>,
    timeout: Duration,
}

impl DongleClient {
    pub fn new(transport: Arc<DongleTransport>, device_id: DeviceId, addr: SocketAddr) -> Self {
        Self {
            transport,
            device_id,
            addr,
            token: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the header token sent with every request.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn message(&self, msg_type: MessageType, payload: Vec<u8>) -> RempMessage {
        RempMessage::new(msg_type, self.device_id, payload).with_token(self.token.clone())
    }

    /// Writes a frame onto the dongle's bus. No reply is expected.
    pub async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let msg = self.message(MessageType::CanFrame, frame.encode()?);
        self.transport.send(&msg, self.addr).await
    }

    pub async fn get_config(&self) -> Result<(ConfigStatus, CanConfig), TransportError> {
        self.config_request(CanConfigPayload::Get).await
    }

    pub async fn set_config(
        &self,
        config: CanConfig,
    ) -> Result<(ConfigStatus, CanConfig), TransportError> {
        self.config_request(CanConfigPayload::Set(config)).await
    }

    async fn config_request(
        &self,
        payload: CanConfigPayload,
    ) -> Result<(ConfigStatus, CanConfig), TransportError> {
        let msg = self
            .message(MessageType::CanConfig, payload.encode())
            .with_flags(FLAG_ACK_REQUESTED);
        let inbound = self
            .transport
            .request(
                &msg,
                self.addr,
                matchers::config_response(self.device_id),
                self.timeout,
            )
            .await?;
        match inbound.message.can_config()? {
            CanConfigPayload::Response { status, config } => Ok((status, config)),
            other => Err(TransportError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Runs a command on the dongle's own CLI.
    pub async fn cli(&self, command: &str, dangerous: bool) -> Result<CliResponse, TransportError> {
        let corr_id = new_correlation_id();
        let payload = CliPayload::Request(CliRequest {
            corr_id,
            dangerous,
            command: command.to_string(),
        });
        let msg = self.message(MessageType::Cli, payload.encode()?);
        let inbound = self
            .transport
            .request(
                &msg,
                self.addr,
                matchers::cli_response(corr_id),
                self.timeout,
            )
            .await?;
        match inbound.message.cli()? {
            CliPayload::Response(resp) => Ok(resp),
            other => Err(TransportError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Asks the dongle to arm pairing mode.
    pub async fn pairing_start(&self) -> Result<PairingReply, TransportError> {
        let corr_id = new_correlation_id();
        self.pairing_request(corr_id, PairingPayload::Start { corr_id })
            .await
    }

    /// Submits a PIN together with the secret the dongle should keep.
    pub async fn pairing_submit(
        &self,
        pin: &str,
        nonce: PairingNonce,
        token: Vec<u8>,
    ) -> Result<PairingReply, TransportError> {
        let corr_id = new_correlation_id();
        let payload = PairingPayload::Submit {
            corr_id,
            pin: pin.to_string(),
            nonce,
            token,
        };
        self.pairing_request(corr_id, payload).await
    }

    async fn pairing_request(
        &self,
        corr_id: [u8; 16],
        payload: PairingPayload,
    ) -> Result<PairingReply, TransportError> {
        let msg = self.message(MessageType::Pairing, payload.encode()?);
        let inbound = self
            .transport
            .request(&msg, self.addr, matchers::pairing_ack(corr_id), self.timeout)
            .await?;
        match inbound.message.pairing()? {
            PairingPayload::Ack {
                status,
                seconds,
                nonce,
                ..
            } => {
                debug!(status = status.as_str(), seconds, "pairing ack");
                Ok(PairingReply {
                    status,
                    seconds,
                    nonce,
                })
            }
            other => Err(TransportError::UnexpectedReply(format!("{other:?}"))),
        }
    }
}
