//! Agent side of the backend channels.
//!
//! Each channel is a WebSocket that opens with `hello`, then runs a write
//! pump (queued messages plus the periodic heartbeat) and a read pump with
//! a 60 s deadline. When the socket drops, the channel reconnects with
//! jittered exponential backoff until cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use canbridge_control::SEND_BUFFER_SIZE;
use canbridge_protocol::constants::{HELLO_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use canbridge_protocol::messages::HelloRequest;
use canbridge_protocol::{ChannelKind, ControlMessage, DataMessage, MessageType};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage, protocol::WebSocketConfig};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// What a channel does with the traffic it carries.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Called once per successful handshake.
    fn on_connected(&self) {}

    fn on_text<'a>(&'a self, text: String) -> HandlerFuture<'a>;

    /// Message sent on every heartbeat tick, if any.
    fn heartbeat(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("backend rejected hello: {0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Send side of a channel that survives reconnects.
///
/// Sends fail fast while the channel is down.
#[derive(Clone, Default)]
pub struct Uplink {
    tx: Arc<Mutex<Option<mpsc::Sender<WsMessage>>>>,
}

impl Uplink {
    pub(crate) fn attach(&self, tx: mpsc::Sender<WsMessage>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub(crate) fn detach(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_connected(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn send_text(&self, text: String) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.try_send(WsMessage::Text(text.into())).is_ok(),
            None => false,
        }
    }

    pub fn send_msg(&self, msg: &ControlMessage) -> bool {
        match msg.to_json() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("failed to encode {}: {e}", msg.msg_type);
                false
            }
        }
    }

    pub fn send_data(&self, msg: &DataMessage) -> bool {
        msg.to_json().is_ok_and(|text| self.send_text(text))
    }
}

/// Everything needed to (re)open one channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub backend_url: String,
    pub hello: HelloRequest,
    pub heartbeat: Duration,
    pub reconnect: ReconnectConfig,
}

impl ChannelOptions {
    fn url(&self, kind: ChannelKind) -> String {
        format!("{}{}", self.backend_url.trim_end_matches('/'), kind.path())
    }
}

/// Keeps one channel connected until `cancel` fires.
pub async fn run_channel(
    kind: ChannelKind,
    opts: ChannelOptions,
    uplink: Uplink,
    handler: Arc<dyn ChannelHandler>,
    cancel: CancellationToken,
) {
    let url = opts.url(kind);
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            r = connect(&url, &opts.hello) => r,
        };
        match connected {
            Ok(ws) => {
                attempt = 0;
                info!(channel = %kind, %url, "connected to backend");
                session(ws, kind, &uplink, &handler, opts.heartbeat, &cancel).await;
                info!(channel = %kind, "backend connection closed");
            }
            Err(e) => warn!(channel = %kind, %url, "connect failed: {e}"),
        }

        attempt = attempt.saturating_add(1);
        let delay = opts.reconnect.delay_for_attempt(attempt);
        debug!(
            channel = %kind,
            attempt,
            delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
            "reconnecting"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect(url: &str, hello: &HelloRequest) -> Result<WsStream, ClientError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    let (mut ws, _) = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;

    let msg = ControlMessage::new(MessageType::Hello, Some(hello))?;
    ws.send(WsMessage::Text(msg.to_json()?.into())).await?;

    let text = tokio::time::timeout(HELLO_TIMEOUT, next_text(&mut ws))
        .await
        .map_err(|_| ClientError::Handshake("no hello reply".into()))??;
    let reply = ControlMessage::from_json(&text)?;
    match reply.msg_type {
        MessageType::HelloOk => Ok(ws),
        MessageType::HelloError => Err(ClientError::Rejected(reply.error.unwrap_or_default())),
        other => Err(ClientError::Handshake(format!("unexpected {other}"))),
    }
}

async fn next_text(ws: &mut WsStream) -> Result<String, ClientError> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(t))) => return Ok(t.as_str().to_owned()),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ClientError::Handshake("closed during handshake".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn session(
    ws: WsStream,
    kind: ChannelKind,
    uplink: &Uplink,
    handler: &Arc<dyn ChannelHandler>,
    heartbeat: Duration,
    cancel: &CancellationToken,
) {
    let conn_cancel = cancel.child_token();
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let (sink, stream) = ws.split();

    uplink.attach(tx.clone());
    let writer = tokio::spawn(write_pump(
        sink,
        rx,
        Arc::clone(handler),
        heartbeat,
        conn_cancel.clone(),
    ));
    handler.on_connected();

    read_pump(stream, kind, &tx, handler, &conn_cancel).await;
    conn_cancel.cancel();
    uplink.detach();
    let _ = writer.await;
}

async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<WsMessage>,
    handler: Arc<dyn ChannelHandler>,
    heartbeat: Duration,
    cancel: CancellationToken,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin,
{
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
            _ = ticker.tick() => match handler.heartbeat() {
                Some(text) => WsMessage::Text(text.into()),
                None => continue,
            },
        };
        if let Err(e) = sink.send(msg).await {
            warn!("write pump send error: {e}");
            break;
        }
    }

    let _ = sink.close().await;
    cancel.cancel();
}

async fn read_pump<S>(
    mut stream: S,
    kind: ChannelKind,
    tx: &mpsc::Sender<WsMessage>,
    handler: &Arc<dyn ChannelHandler>,
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
                warn!(channel = %kind, "no traffic from backend, dropping connection");
                break;
            }

            frame = stream.next() => {
                let msg = match frame {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(channel = %kind, "read error: {e}");
                        break;
                    }
                    None => break,
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    WsMessage::Text(text) => handler.on_text(text.as_str().to_owned()).await,
                    WsMessage::Ping(data) => {
                        let _ = tx.try_send(WsMessage::Pong(data));
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Pong(_) | WsMessage::Binary(_) | WsMessage::Frame(_) => {}
                }
            }
        }
    }
}
