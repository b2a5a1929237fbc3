//! Wires the backend together and exposes the operations an operator
//! surface drives: pairing, security holds, groups, dongle requests, host
//! commands and event subscriptions.

use std::net::SocketAddr;
use std::sync::Arc;

use canbridge_control::{
    CommandAllowlist, CommandRecord, CommandTracker, ConnectionManager, ControlError,
    ControlServer, ServerConfig, StaticTokens,
};
use canbridge_pairing::{
    AuditEntry, DongleRecord, MemoryStore, PairingError, PairingService, PairingSession,
    SecurityHold, StartOutcome, SubmitOutcome, SystemClock,
};
use canbridge_protocol::MessageType;
use canbridge_protocol::messages::{
    CanConfigGetRequest, CanConfigResult, CanConfigSetRequest, CliExecRequest, CliExecResult,
};
use canbridge_relay::{
    Group, GroupState, MemoryLastSeen, MemoryLog, RelayConfig, RelayEngine, RelayError,
};
use canbridge_remp::CanConfig;
use canbridge_stream::{EventKind, StreamManager, Subscription, parse_last_event_id};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::directory::DongleDirectory;
use crate::events::{self, group_topic};
use crate::hooks::BackendHooks;
use crate::links::{ControlDataLink, ControlPairingLink};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("no agent serves dongle {0}")]
    Unassigned(String),
}

pub struct Backend {
    manager: Arc<ConnectionManager>,
    commands: CommandTracker,
    relay: Arc<RelayEngine>,
    streams: Arc<StreamManager>,
    store: Arc<MemoryStore>,
    directory: Arc<DongleDirectory>,
    pairing: PairingService,
    server: Arc<ControlServer>,
}

impl Backend {
    pub fn new(cfg: &BackendConfig) -> Arc<Self> {
        let manager = Arc::new(ConnectionManager::new(cfg.request_timeout()));
        let relay = Arc::new(RelayEngine::new(
            Arc::new(ControlDataLink::new(Arc::clone(&manager))),
            Arc::new(MemoryLog::new(cfg.max_buffered)),
            Arc::new(MemoryLastSeen::new()),
            RelayConfig {
                last_seen_interval: cfg.last_seen_interval(),
            },
        ));
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(DongleDirectory::new(
            Arc::clone(&relay),
            Arc::clone(&store),
        ));
        let pairing = PairingService::new(
            Arc::new(ControlPairingLink::new(
                Arc::clone(&manager),
                Arc::clone(&directory),
            )),
            store.clone(),
            store.clone(),
            Arc::new(SystemClock),
            (&cfg.pairing).into(),
        );
        let streams = Arc::new(StreamManager::new((&cfg.stream).into()));
        let commands = CommandTracker::new(CommandAllowlist::new(cfg.commands.clone()));

        for group in &cfg.groups {
            relay.add_group(group.clone());
        }
        for (dongle, agent) in &cfg.dongles {
            directory.assign(dongle, agent);
        }

        let server = ControlServer::new(
            ServerConfig {
                bind_addr: cfg.listen_addr,
            },
            Arc::clone(&manager),
            commands.clone(),
            Arc::new(BackendHooks::new(
                Arc::clone(&relay),
                Arc::clone(&streams),
                Arc::clone(&directory),
            )),
            Arc::new(StaticTokens::new(cfg.agent_tokens.clone())),
        );

        Arc::new(Self {
            manager,
            commands,
            relay,
            streams,
            store,
            directory,
            pairing,
            server,
        })
    }

    /// Serves agents until `cancel` fires, then closes every agent socket.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        {
            let server = Arc::clone(&self.server);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = server.run().await {
                    error!("control server failed: {e}");
                    cancel.cancel();
                }
            });
        }
        tasks.spawn(events::forward_group_states(
            Arc::clone(&self.streams),
            self.relay.subscribe(),
            cancel.clone(),
        ));
        tasks.spawn(events::forward_command_status(
            Arc::clone(&self.streams),
            self.commands.subscribe(),
            cancel.clone(),
        ));

        // Seed every group topic with where things stand.
        for (_, state) in self.relay.groups() {
            events::publish(
                &self.streams,
                &group_topic(&state.group_id),
                EventKind::GroupState,
                &state,
            );
        }

        cancel.cancelled().await;
        info!("backend shutting down");
        self.server.shutdown();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Where agents connect, once [`run`](Self::run) has bound the listener.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    pub fn connected_agents(&self) -> Vec<String> {
        self.manager.connected_agents()
    }

    /// Subscribes to a topic, resuming after the raw `Last-Event-ID` value
    /// when it names an event.
    pub fn subscribe(&self, topic: &str, last_event_id: Option<&str>) -> Subscription {
        self.streams
            .subscribe(topic, parse_last_event_id(last_event_id))
    }

    // -- pairing and holds --------------------------------------------------

    pub async fn start_pairing(
        &self,
        dongle_id: &str,
        user_id: &str,
    ) -> Result<StartOutcome, BackendError> {
        Ok(self.pairing.start(dongle_id, user_id).await?)
    }

    pub async fn submit_pin(
        &self,
        session_id: Uuid,
        user_id: &str,
        pin: &str,
    ) -> Result<SubmitOutcome, BackendError> {
        Ok(self.pairing.submit(session_id, user_id, pin).await?)
    }

    pub async fn pairing_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PairingSession>, BackendError> {
        Ok(self.pairing.session(session_id).await?)
    }

    pub async fn active_hold(&self, dongle_id: &str) -> Result<Option<SecurityHold>, BackendError> {
        Ok(self.pairing.active_hold(dongle_id).await?)
    }

    /// Lifts a hold. Returns whether one was in force.
    pub async fn clear_hold(&self, dongle_id: &str, operator_id: &str) -> Result<bool, BackendError> {
        Ok(self.pairing.clear_hold(dongle_id, operator_id).await?)
    }

    pub fn dongle(&self, dongle_id: &str) -> Option<DongleRecord> {
        self.store.dongle(dongle_id)
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.store.audit_log()
    }

    // -- groups --------------------------------------------------------------

    pub fn add_group(&self, group: Group) -> Option<GroupState> {
        let id = group.id.clone();
        self.relay.add_group(group);
        self.relay.group_state(&id)
    }

    pub fn remove_group(&self, group_id: &str) -> bool {
        self.relay.remove_group(group_id)
    }

    pub fn set_group_enabled(&self, group_id: &str, enabled: bool) -> Result<GroupState, BackendError> {
        Ok(self.relay.set_enabled(group_id, enabled)?)
    }

    pub fn groups(&self) -> Vec<(Group, GroupState)> {
        self.relay.groups()
    }

    pub fn assign_dongle(&self, dongle_id: &str, agent_id: &str) -> bool {
        self.directory.assign(dongle_id, agent_id)
    }

    // -- dongle requests -----------------------------------------------------

    fn agent_for(&self, dongle_id: &str) -> Result<String, BackendError> {
        self.directory
            .agent_for(dongle_id)
            .ok_or_else(|| BackendError::Unassigned(dongle_id.to_string()))
    }

    pub async fn can_config_get(&self, dongle_id: &str) -> Result<CanConfigResult, BackendError> {
        let agent = self.agent_for(dongle_id)?;
        let req = CanConfigGetRequest {
            dongle_id: dongle_id.to_string(),
        };
        Ok(self
            .manager
            .call(&agent, MessageType::CanConfigGet, &req)
            .await?)
    }

    pub async fn can_config_set(
        &self,
        dongle_id: &str,
        config: CanConfig,
    ) -> Result<CanConfigResult, BackendError> {
        let agent = self.agent_for(dongle_id)?;
        let req = CanConfigSetRequest {
            dongle_id: dongle_id.to_string(),
            config,
        };
        Ok(self
            .manager
            .call(&agent, MessageType::CanConfigSet, &req)
            .await?)
    }

    pub async fn cli_exec(
        &self,
        dongle_id: &str,
        command: &str,
        dangerous: bool,
    ) -> Result<CliExecResult, BackendError> {
        let agent = self.agent_for(dongle_id)?;
        let req = CliExecRequest {
            dongle_id: dongle_id.to_string(),
            command: command.to_string(),
            dangerous,
        };
        Ok(self.manager.call(&agent, MessageType::CliExec, &req).await?)
    }

    // -- host commands -------------------------------------------------------

    pub async fn execute_command(
        &self,
        agent_id: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<CommandRecord, BackendError> {
        Ok(self
            .commands
            .execute(&self.manager, agent_id, command, args)
            .await?)
    }

    pub fn command(&self, command_id: &str) -> Option<CommandRecord> {
        self.commands.get(command_id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use canbridge_control::CommandPolicy;
    use canbridge_pairing::{HoldReason, Ownership};
    use canbridge_protocol::ControlMessage;
    use canbridge_protocol::constants::PROTOCOL_VERSION;
    use canbridge_protocol::messages::{
        AckStatus, CommandExecAck, CommandExecRequest, CommandOutcome, CommandResponse,
        HelloRequest, PairingAck, PairingSubmitRequest,
    };
    use canbridge_relay::GroupMode;
    use canbridge_remp::ConfigStatus;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use super::*;
    use crate::events::{AGENTS_TOPIC, COMMANDS_TOPIC};

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn config() -> BackendConfig {
        BackendConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            agent_tokens: HashMap::from([("agent-a".to_string(), "tok".to_string())]),
            dongles: HashMap::from([("d1".to_string(), "agent-a".to_string())]),
            groups: vec![Group::new("g1", "d1", "d2")],
            commands: vec![CommandPolicy {
                name: "uptime".into(),
                max_args: 0,
                timeout: Duration::from_secs(30),
            }],
            ..BackendConfig::default()
        }
    }

    type Running = (
        Arc<Backend>,
        SocketAddr,
        CancellationToken,
        JoinHandle<anyhow::Result<()>>,
    );

    async fn start(cfg: &BackendConfig) -> Running {
        let backend = Backend::new(cfg);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&backend).run(cancel.clone()));
        let addr = loop {
            if let Some(a) = backend.local_addr().await {
                break a;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        (backend, addr, cancel, task)
    }

    async fn recv(ws: &mut Ws) -> ControlMessage {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(t))) => return ControlMessage::from_json(&t).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    async fn send(ws: &mut Ws, msg: &ControlMessage) {
        ws.send(WsMessage::Text(msg.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    /// Connects the control channel as `agent-a`.
    async fn agent(addr: SocketAddr) -> Ws {
        let (mut ws, _) = connect_async(format!("ws://{addr}/agent/control"))
            .await
            .unwrap();
        let hello = HelloRequest {
            agent_id: "agent-a".into(),
            token: "tok".into(),
            version: PROTOCOL_VERSION,
        };
        send(&mut ws, &ControlMessage::new(MessageType::Hello, Some(&hello)).unwrap()).await;
        assert_eq!(recv(&mut ws).await.msg_type, MessageType::HelloOk);
        ws
    }

    async fn wait_connected(backend: &Backend) {
        while backend.connected_agents().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn dongle_requests_reach_the_serving_agent() {
        let (backend, addr, cancel, task) = start(&config()).await;
        let mut presence = backend.subscribe(AGENTS_TOPIC, None);
        let mut ws = agent(addr).await;
        wait_connected(&backend).await;

        let b = Arc::clone(&backend);
        let call = tokio::spawn(async move { b.can_config_get("d1").await });
        let req = recv(&mut ws).await;
        assert_eq!(req.msg_type, MessageType::CanConfigGet);
        let result = CanConfigResult {
            dongle_id: "d1".into(),
            status: ConfigStatus::Ok,
            config: CanConfig::default(),
        };
        send(
            &mut ws,
            &req.reply(MessageType::CanConfigGetResult, Some(&result)).unwrap(),
        )
        .await;
        assert_eq!(call.await.unwrap().unwrap(), result);

        assert!(matches!(
            backend.cli_exec("nope", "version", false).await,
            Err(BackendError::Unassigned(_))
        ));

        let ev = presence.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Presence);
        assert_eq!(ev.data["agent_id"], "agent-a");

        cancel.cancel();
        task.await.unwrap().unwrap();
        // The agent socket is closed on shutdown.
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn pairing_runs_over_the_control_channel() {
        let (backend, addr, cancel, task) = start(&config()).await;
        let mut ws = agent(addr).await;
        wait_connected(&backend).await;

        let b = Arc::clone(&backend);
        let start = tokio::spawn(async move { b.start_pairing("d1", "alice").await });
        let req = recv(&mut ws).await;
        assert_eq!(req.msg_type, MessageType::PairingStart);
        let armed = PairingAck {
            dongle_id: "d1".into(),
            status: AckStatus::Ok,
            seconds: 60,
            nonce: Some("ab".repeat(16)),
        };
        send(&mut ws, &req.reply(MessageType::PairingStartResult, Some(&armed)).unwrap()).await;
        let StartOutcome::Armed(session) = start.await.unwrap().unwrap() else {
            panic!("not armed");
        };

        let b = Arc::clone(&backend);
        let id = session.id;
        let submit = tokio::spawn(async move { b.submit_pin(id, "alice", "123456").await });
        let req = recv(&mut ws).await;
        let body: PairingSubmitRequest = req.parse_payload().unwrap().unwrap();
        assert_eq!(body.nonce, "ab".repeat(16));
        assert_eq!(body.token.len(), 32);
        let ok = PairingAck {
            dongle_id: "d1".into(),
            status: AckStatus::Ok,
            seconds: 0,
            nonce: None,
        };
        send(&mut ws, &req.reply(MessageType::PairingSubmitResult, Some(&ok)).unwrap()).await;
        assert!(matches!(
            submit.await.unwrap().unwrap(),
            SubmitOutcome::Paired(_)
        ));

        let rec = backend.dongle("d1").unwrap();
        assert_eq!(rec.ownership, Ownership::Owned);
        assert_eq!(rec.owner_user_id.as_deref(), Some("alice"));
        assert_eq!(rec.agent_id.as_deref(), Some("agent-a"));
        assert!(!backend.audit_log().is_empty());
        let stored = backend.pairing_session(id).await.unwrap().unwrap();
        assert_eq!(stored.status, canbridge_pairing::SessionStatus::Success);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn device_cooldown_holds_until_cleared() {
        let (backend, addr, cancel, task) = start(&config()).await;
        let mut ws = agent(addr).await;
        wait_connected(&backend).await;

        let b = Arc::clone(&backend);
        let start = tokio::spawn(async move { b.start_pairing("d1", "alice").await });
        let req = recv(&mut ws).await;
        let cooldown = PairingAck {
            dongle_id: "d1".into(),
            status: AckStatus::Cooldown,
            seconds: 300,
            nonce: None,
        };
        send(&mut ws, &req.reply(MessageType::PairingStartResult, Some(&cooldown)).unwrap()).await;
        assert!(matches!(
            start.await.unwrap().unwrap(),
            StartOutcome::Held { .. }
        ));

        let hold = backend.active_hold("d1").await.unwrap().unwrap();
        assert_eq!(hold.reason, HoldReason::DeviceCooldown);
        assert_eq!(backend.dongle("d1").unwrap().ownership, Ownership::Held);

        assert!(backend.clear_hold("d1", "operator").await.unwrap());
        assert!(backend.active_hold("d1").await.unwrap().is_none());
        assert!(!backend.clear_hold("d1", "operator").await.unwrap());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn group_changes_are_published() {
        let (backend, _addr, cancel, task) = start(&config()).await;

        // Seeded on startup, resumable from the beginning.
        let mut g1 = backend.subscribe("group:g1", Some("0"));
        let seed = g1.recv().await.unwrap();
        assert_eq!(seed.kind, EventKind::GroupState);
        assert_eq!(seed.data["mode"], "DEGRADED");

        let state = backend.set_group_enabled("g1", false).unwrap();
        assert_eq!(state.mode, GroupMode::Inactive);
        let ev = g1.recv().await.unwrap();
        assert_eq!(ev.data["mode"], "INACTIVE");

        let mut g2 = backend.subscribe("group:g2", None);
        let added = backend.add_group(Group::new("g2", "d3", "d4")).unwrap();
        assert_eq!(added.mode, GroupMode::Degraded);
        assert_eq!(g2.recv().await.unwrap().data["group_id"], "g2");
        assert_eq!(backend.groups().len(), 2);

        assert!(backend.remove_group("g2"));
        assert!(matches!(
            backend.set_group_enabled("g2", true),
            Err(BackendError::Relay(RelayError::UnknownGroup(_)))
        ));

        assert!(backend.assign_dongle("d2", "agent-b"));
        assert!(!backend.assign_dongle("d2", "agent-b"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn host_commands_report_status() {
        let (backend, addr, cancel, task) = start(&config()).await;
        let mut commands = backend.subscribe(COMMANDS_TOPIC, None);
        let mut ws = agent(addr).await;
        wait_connected(&backend).await;

        assert!(matches!(
            backend.execute_command("agent-a", "rm", vec!["-rf".into()]).await,
            Err(BackendError::Control(ControlError::CommandNotAllowed(_)))
        ));

        let b = Arc::clone(&backend);
        let exec = tokio::spawn(async move { b.execute_command("agent-a", "uptime", vec![]).await });
        let req = recv(&mut ws).await;
        assert_eq!(req.msg_type, MessageType::CommandExec);
        let body: CommandExecRequest = req.parse_payload().unwrap().unwrap();
        let ack = CommandExecAck {
            command_id: body.command_id.clone(),
        };
        send(&mut ws, &req.reply(MessageType::CommandExecAck, Some(&ack)).unwrap()).await;
        let record = exec.await.unwrap().unwrap();
        assert_eq!(record.command_id, body.command_id);

        let done = CommandResponse {
            command_id: body.command_id.clone(),
            outcome: CommandOutcome::Completed,
            exit_code: Some(0),
            error: None,
        };
        send(
            &mut ws,
            &ControlMessage::new(MessageType::CommandResponse, Some(&done)).unwrap(),
        )
        .await;

        let running = commands.recv().await.unwrap();
        assert_eq!(running.kind, EventKind::CommandStatus);
        assert_eq!(running.data["status"], "running");
        let finished = commands.recv().await.unwrap();
        assert_eq!(finished.data["status"], "completed");
        assert_eq!(finished.data["exit_code"], 0);
        assert!(backend.command(&body.command_id).unwrap().status.is_terminal());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
