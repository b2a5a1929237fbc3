//! WebSocket listener for agent channels.
//!
//! Agents connect to `/agent/control` and `/agent/data`. The first frame on
//! either socket must be a `hello` carrying the agent id and token; anything
//! else closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use canbridge_protocol::constants::{HELLO_TIMEOUT, PROTOCOL_VERSION, WS_MAX_MESSAGE_SIZE};
use canbridge_protocol::messages::{HelloOk, HelloRequest};
use canbridge_protocol::{ChannelKind, ControlMessage, MessageType};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ControlError;
use crate::commands::CommandTracker;
use crate::connection::run_socket;
use crate::dispatch::Context;
use crate::hooks::{AgentAuthenticator, AgentHooks};
use crate::manager::ConnectionManager;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9180)),
        }
    }
}

/// Accepts agent sockets and hands them to the [`ConnectionManager`].
pub struct ControlServer {
    config: ServerConfig,
    ctx: Arc<Context>,
    auth: Arc<dyn AgentAuthenticator>,
    local_addr: Mutex<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl ControlServer {
    pub fn new(
        config: ServerConfig,
        manager: Arc<ConnectionManager>,
        commands: CommandTracker,
        hooks: Arc<dyn AgentHooks>,
        auth: Arc<dyn AgentAuthenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ctx: Arc::new(Context {
                manager,
                commands,
                hooks,
            }),
            auth,
            local_addr: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to, once [`run`](Self::run) started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Stops accepting and closes every agent socket.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the listener until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ControlError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("control server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("control server shutting down");
                    self.ctx.manager.close_all();
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!(%peer_addr, "agent connection error: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("accept error: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ControlError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let mut kind = None;
        let route = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match ChannelKind::from_path(req.uri().path()) {
                Some(k) => {
                    kind = Some(k);
                    Ok(resp)
                }
                None => {
                    let mut err = ErrorResponse::new(Some("unknown channel".into()));
                    *err.status_mut() = StatusCode::NOT_FOUND;
                    Err(err)
                }
            }
        };
        let mut ws = accept_hdr_async_with_config(stream, route, Some(ws_config)).await?;
        let Some(kind) = kind else {
            return Err(ControlError::Handshake("no channel selected".into()));
        };
        debug!(%peer_addr, channel = %kind, "socket upgraded, waiting for hello");

        let agent_id = match tokio::time::timeout(HELLO_TIMEOUT, self.hello(&mut ws)).await {
            Ok(Ok(agent_id)) => agent_id,
            Ok(Err(e)) => {
                let reply = ControlMessage::error(None, MessageType::HelloError, e.to_string());
                if let Ok(text) = reply.to_json() {
                    let _ = ws.send(WsMessage::Text(text.into())).await;
                }
                let _ = ws.close(None).await;
                return Err(e);
            }
            Err(_) => {
                let _ = ws.close(None).await;
                return Err(ControlError::Handshake("hello timed out".into()));
            }
        };

        let ok = ControlMessage::new(
            MessageType::HelloOk,
            Some(&HelloOk {
                version: PROTOCOL_VERSION,
            }),
        )?;
        ws.send(WsMessage::Text(ok.to_json()?.into())).await?;
        info!(%peer_addr, agent = %agent_id, channel = %kind, "agent authenticated");

        run_socket(
            ws,
            Arc::clone(&self.ctx),
            agent_id,
            kind,
            self.cancel.child_token(),
        )
        .await;
        Ok(())
    }

    /// Reads and verifies the opening `hello`. Returns the agent id.
    async fn hello(&self, ws: &mut WebSocketStream<TcpStream>) -> Result<String, ControlError> {
        let text = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(t))) => break t,
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(_)) => return Err(ControlError::Handshake("expected hello".into())),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ControlError::ChannelClosed),
            }
        };

        let msg = ControlMessage::from_json(&text)?;
        if msg.msg_type != MessageType::Hello {
            return Err(ControlError::Handshake(format!(
                "expected hello, got {}",
                msg.msg_type
            )));
        }
        let hello: HelloRequest = msg.parse_payload()?.ok_or(ControlError::MissingPayload)?;
        if hello.version != PROTOCOL_VERSION {
            return Err(ControlError::Handshake(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }
        if hello.agent_id.is_empty() || !self.auth.authenticate(&hello).await {
            return Err(ControlError::Handshake("authentication failed".into()));
        }
        Ok(hello.agent_id)
    }
}
