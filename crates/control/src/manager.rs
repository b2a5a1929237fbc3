use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canbridge_protocol::constants::REQUEST_TIMEOUT;
use canbridge_protocol::{ChannelKind, ControlMessage, DataMessage, MessageType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ControlError;
use crate::connection::Outbound;

struct Registered {
    conn_id: u64,
    outbound: Outbound,
    cancel: CancellationToken,
}

struct Pending {
    agent_id: String,
    /// The control socket the request went out on.
    conn_id: u64,
    tx: oneshot::Sender<Result<ControlMessage, ControlError>>,
}

/// Live agent sockets and the requests waiting on them.
///
/// At most one socket is registered per agent and channel; registering a
/// new one closes the old.
pub struct ConnectionManager {
    connections: Mutex<HashMap<(String, ChannelKind), Registered>>,
    pending: Mutex<HashMap<String, Pending>>,
    last_seen: Mutex<HashMap<String, Instant>>,
    next_conn_id: AtomicU64,
    request_timeout: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(REQUEST_TIMEOUT)
    }
}

impl ConnectionManager {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<(String, ChannelKind), Registered>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a socket, closing any socket it replaces. Returns the
    /// connection id to pass to [`unregister`](Self::unregister).
    pub fn register(
        &self,
        agent_id: &str,
        kind: ChannelKind,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let old = self.connections().insert(
            (agent_id.to_string(), kind),
            Registered {
                conn_id,
                outbound,
                cancel,
            },
        );
        if let Some(old) = old {
            info!(agent = agent_id, channel = %kind, old = old.conn_id, new = conn_id, "replacing agent connection");
            old.cancel.cancel();
            if kind == ChannelKind::Control {
                self.reject_conn(agent_id, old.conn_id);
            }
        }
        self.touch(agent_id);
        conn_id
    }

    /// Removes a socket if it is still the registered one. A stale socket
    /// that was already replaced leaves the registry untouched.
    ///
    /// Closing a control socket rejects the requests sent on it, whether or
    /// not it was still the registered one.
    pub fn unregister(&self, agent_id: &str, kind: ChannelKind, conn_id: u64) -> bool {
        if kind == ChannelKind::Control {
            self.reject_conn(agent_id, conn_id);
        }
        let key = (agent_id.to_string(), kind);
        let removed = {
            let mut conns = self.connections();
            match conns.get(&key) {
                Some(r) if r.conn_id == conn_id => conns.remove(&key),
                _ => None,
            }
        };
        let Some(removed) = removed else {
            return false;
        };
        removed.cancel.cancel();
        true
    }

    fn reject_conn(&self, agent_id: &str, conn_id: u64) {
        let rejected: Vec<Pending> = {
            let mut pending = self.pending();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.agent_id == agent_id && p.conn_id == conn_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        if !rejected.is_empty() {
            debug!(agent = agent_id, conn = conn_id, count = rejected.len(), "rejecting pending requests");
        }
        for p in rejected {
            let _ = p.tx.send(Err(ControlError::ChannelClosed));
        }
    }

    /// Closes every socket and fails every pending request. Sockets
    /// unregister themselves as their pumps stop.
    pub fn close_all(&self) {
        for r in self.connections().values() {
            r.cancel.cancel();
        }
        let pending: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p.tx.send(Err(ControlError::ChannelClosed));
        }
    }

    pub fn outbound(&self, agent_id: &str, kind: ChannelKind) -> Option<Outbound> {
        self.connections()
            .get(&(agent_id.to_string(), kind))
            .map(|r| r.outbound.clone())
    }

    fn live_control(&self, agent_id: &str) -> Option<(u64, Outbound)> {
        self.connections()
            .get(&(agent_id.to_string(), ChannelKind::Control))
            .filter(|r| r.outbound.is_connected())
            .map(|r| (r.conn_id, r.outbound.clone()))
    }

    pub fn is_connected(&self, agent_id: &str, kind: ChannelKind) -> bool {
        self.outbound(agent_id, kind)
            .is_some_and(|o| o.is_connected())
    }

    /// Agents with a live control channel.
    pub fn connected_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .connections()
            .iter()
            .filter(|((_, kind), r)| *kind == ChannelKind::Control && r.outbound.is_connected())
            .map(|((agent, _), _)| agent.clone())
            .collect();
        agents.sort();
        agents
    }

    /// Records that something arrived from `agent_id`.
    pub fn touch(&self, agent_id: &str) {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), Instant::now());
    }

    pub fn last_seen(&self, agent_id: &str) -> Option<Instant> {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Sends a correlated request on the agent's control channel and waits
    /// for the matching reply. An `_error` reply becomes
    /// [`ControlError::Remote`].
    pub async fn send_control_request<T: Serialize>(
        &self,
        agent_id: &str,
        msg_type: MessageType,
        payload: Option<&T>,
        timeout: Option<Duration>,
    ) -> Result<ControlMessage, ControlError> {
        let (conn_id, outbound) = self
            .live_control(agent_id)
            .ok_or_else(|| ControlError::AgentOffline(agent_id.to_string()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let msg = ControlMessage::request(&id, msg_type, payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(
            id.clone(),
            Pending {
                agent_id: agent_id.to_string(),
                conn_id,
                tx,
            },
        );

        if let Err(e) = outbound.send_msg(&msg) {
            self.pending().remove(&id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout.unwrap_or(self.request_timeout), rx).await;

        // Clean up pending entry on any exit path.
        self.pending().remove(&id);

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ControlError::ChannelClosed),
            Err(_) => {
                warn!(agent = agent_id, %msg_type, request_id = %id, "control request timed out");
                Err(ControlError::Timeout)
            }
        }
    }

    /// [`send_control_request`](Self::send_control_request) with a typed
    /// reply payload.
    pub async fn call<T: Serialize, R: DeserializeOwned>(
        &self,
        agent_id: &str,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<R, ControlError> {
        let reply = self
            .send_control_request(agent_id, msg_type, Some(payload), None)
            .await?;
        reply.parse_payload()?.ok_or(ControlError::MissingPayload)
    }

    /// Resolves the pending request a reply belongs to. Returns `false` when
    /// nothing was waiting for it.
    pub fn resolve(&self, agent_id: &str, msg: ControlMessage) -> bool {
        let Some(id) = msg.request_id.as_deref() else {
            return false;
        };
        let entry = {
            let mut pending = self.pending();
            match pending.get(id) {
                Some(p) if p.agent_id == agent_id => pending.remove(id),
                Some(_) => {
                    warn!(agent = agent_id, request_id = id, "reply from an agent that does not own the request");
                    None
                }
                None => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        let outcome = if msg.msg_type.is_error() {
            Err(ControlError::Remote {
                msg_type: msg.msg_type,
                message: msg.error.unwrap_or_else(|| "unspecified error".into()),
            })
        } else {
            Ok(msg)
        };
        let _ = entry.tx.send(outcome);
        true
    }

    /// Queues a data-channel message for an agent.
    pub fn send_data(&self, agent_id: &str, msg: &DataMessage) -> Result<(), ControlError> {
        self.outbound(agent_id, ChannelKind::Data)
            .filter(Outbound::is_connected)
            .ok_or_else(|| ControlError::AgentOffline(agent_id.to_string()))?
            .send_data(msg)
    }
}
