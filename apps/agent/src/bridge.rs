//! CAN frames between dongles and the data channel.

use std::sync::Arc;

use canbridge_protocol::{CanFrameRelay, DataMessage};
use canbridge_remp::device_id_hex;
use canbridge_transport::InboundFrame;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::{ChannelHandler, HandlerFuture, Uplink};
use crate::dongles::DongleRegistry;

/// Forwards frames the dongles emit to the backend until cancelled.
///
/// Frames are dropped, not queued, while the data channel is down.
pub async fn forward_frames(
    mut frames: broadcast::Receiver<InboundFrame>,
    uplink: Uplink,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return,
            r = frames.recv() => match r {
                Ok(f) => f,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "frame forwarder lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };

        let msg = DataMessage::CanFrame(CanFrameRelay {
            group_id: None,
            source_dongle_id: device_id_hex(&inbound.device_id),
            target_dongle_id: None,
            frame: inbound.frame,
            ts_us: Some(inbound.timestamp_us),
        });
        if !uplink.send_data(&msg) {
            trace!("data channel down, frame dropped");
        }
    }
}

/// Writes relayed frames from the backend onto the target dongle's bus.
pub struct FrameSink {
    registry: Arc<DongleRegistry>,
}

impl FrameSink {
    pub fn new(registry: Arc<DongleRegistry>) -> Self {
        Self { registry }
    }
}

impl ChannelHandler for FrameSink {
    fn on_text<'a>(&'a self, text: String) -> HandlerFuture<'a> {
        Box::pin(async move {
            let relay = match DataMessage::from_json(&text) {
                Ok(DataMessage::CanFrame(r)) => r,
                Ok(DataMessage::Unknown) => {
                    debug!("unknown data message");
                    return;
                }
                Err(e) => {
                    debug!("invalid data message: {e}");
                    return;
                }
            };
            let Some(target) = relay.target_dongle_id.as_deref() else {
                debug!(source = %relay.source_dongle_id, "relayed frame without target");
                return;
            };
            let Some(client) = self.registry.client(target) else {
                debug!(dongle = target, "relay target not visible, frame dropped");
                return;
            };
            if let Err(e) = client.send_frame(&relay.frame).await {
                warn!(dongle = target, "frame write failed: {e}");
            }
        })
    }
}
