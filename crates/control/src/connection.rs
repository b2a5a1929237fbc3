//! Per-socket send handle and the pumps that drive one agent socket.

use std::sync::Arc;

use canbridge_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use canbridge_protocol::{ChannelKind, ControlMessage, DataMessage};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ControlError;
use crate::dispatch::{Context, handle_data, handle_incoming};

/// Outbound queue depth per socket. Relayed CAN bursts land here.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Handle for queueing messages on one agent socket.
///
/// Cloneable; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<WsMessage>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    pub fn send_text(&self, text: String) -> Result<(), ControlError> {
        self.tx.try_send(WsMessage::Text(text.into())).map_err(|_| {
            warn!("send buffer full or closed, dropping message");
            ControlError::SendFailed
        })
    }

    pub fn send_msg(&self, msg: &ControlMessage) -> Result<(), ControlError> {
        self.send_text(msg.to_json()?)
    }

    pub fn send_data(&self, msg: &DataMessage) -> Result<(), ControlError> {
        self.send_text(msg.to_json()?)
    }

    pub(crate) fn send_raw(&self, msg: WsMessage) -> Result<(), ControlError> {
        self.tx.try_send(msg).map_err(|_| ControlError::SendFailed)
    }

    /// Returns `true` while the socket's write pump is alive.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Spawns the write pump and runs the read pump for an authenticated socket
/// until it closes or `cancel` fires.
pub(crate) async fn run_socket<S>(
    ws: S,
    ctx: Arc<Context>,
    agent_id: String,
    kind: ChannelKind,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let outbound = Outbound::new(tx);
    let (sink, stream) = ws.split();

    tokio::spawn(write_pump(sink, rx, cancel.clone()));

    let conn_id = ctx
        .manager
        .register(&agent_id, kind, outbound.clone(), cancel.clone());
    info!(agent = %agent_id, channel = %kind, conn_id, "agent channel connected");
    ctx.hooks.on_connected(&agent_id, kind).await;

    read_pump(stream, &ctx, &agent_id, kind, &outbound, &cancel).await;
    cancel.cancel();

    if ctx.manager.unregister(&agent_id, kind, conn_id) {
        info!(agent = %agent_id, channel = %kind, "agent channel disconnected");
        ctx.hooks.on_disconnected(&agent_id, kind).await;
    } else {
        debug!(agent = %agent_id, channel = %kind, conn_id, "replaced connection closed");
    }
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    cancel.cancel();
}

/// Read pump: any inbound frame pushes the read deadline forward.
async fn read_pump<S>(
    mut stream: S,
    ctx: &Arc<Context>,
    agent_id: &str,
    kind: ChannelKind,
    outbound: &Outbound,
    cancel: &CancellationToken,
) where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = &mut deadline => {
                warn!(agent = agent_id, channel = %kind, "read deadline passed, closing connection");
                break;
            }

            frame = stream.next() => {
                let ws_msg = match frame {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(agent = agent_id, channel = %kind, "read pump error: {e}");
                        break;
                    }
                    None => break,
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                ctx.manager.touch(agent_id);

                match ws_msg {
                    WsMessage::Text(text) => {
                        if text.len() > WS_MAX_MESSAGE_SIZE {
                            error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        match kind {
                            ChannelKind::Control => match ControlMessage::from_json(&text) {
                                Ok(msg) => handle_incoming(ctx, agent_id, outbound, msg).await,
                                Err(e) => debug!(agent = agent_id, "invalid control message: {e}"),
                            },
                            ChannelKind::Data => match DataMessage::from_json(&text) {
                                Ok(msg) => handle_data(ctx, agent_id, msg).await,
                                Err(e) => debug!(agent = agent_id, "invalid data message: {e}"),
                            },
                        }
                    }
                    WsMessage::Ping(data) => {
                        let _ = outbound.send_raw(WsMessage::Pong(data));
                    }
                    WsMessage::Close(_) => {
                        debug!(agent = agent_id, channel = %kind, "received close frame");
                        break;
                    }
                    WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_reports_closed_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let out = Outbound::new(tx);
        assert!(out.is_connected());
        out.send_text("a".into()).unwrap();

        // Full queue is a send failure, not a block.
        assert!(matches!(
            out.send_text("b".into()),
            Err(ControlError::SendFailed)
        ));
        assert!(matches!(rx.recv().await, Some(WsMessage::Text(t)) if t.as_str() == "a"));

        drop(rx);
        assert!(!out.is_connected());
    }
}
