//! Collaborator traits the control layer calls into.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use canbridge_protocol::messages::{DongleLostReport, DongleSightingReport, Heartbeat, HelloRequest};
use canbridge_protocol::{CanFrameRelay, ChannelKind};

/// A boxed future returned by hook methods.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Backend reactions to agent activity.
///
/// Every method defaults to doing nothing so implementors only override
/// what they need. Hooks run on the socket's read pump, so messages from
/// one socket are seen in arrival order.
pub trait AgentHooks: Send + Sync + 'static {
    fn on_connected<'a>(&'a self, agent_id: &'a str, kind: ChannelKind) -> HookFuture<'a> {
        let _ = (agent_id, kind);
        Box::pin(async {})
    }

    fn on_disconnected<'a>(&'a self, agent_id: &'a str, kind: ChannelKind) -> HookFuture<'a> {
        let _ = (agent_id, kind);
        Box::pin(async {})
    }

    fn on_heartbeat<'a>(&'a self, agent_id: &'a str, heartbeat: Heartbeat) -> HookFuture<'a> {
        let _ = (agent_id, heartbeat);
        Box::pin(async {})
    }

    fn on_sighting<'a>(
        &'a self,
        agent_id: &'a str,
        report: DongleSightingReport,
    ) -> HookFuture<'a> {
        let _ = (agent_id, report);
        Box::pin(async {})
    }

    fn on_dongle_lost<'a>(&'a self, agent_id: &'a str, report: DongleLostReport) -> HookFuture<'a> {
        let _ = (agent_id, report);
        Box::pin(async {})
    }

    /// A CAN frame arrived on the agent's data channel.
    fn on_frame<'a>(&'a self, agent_id: &'a str, frame: CanFrameRelay) -> HookFuture<'a> {
        let _ = (agent_id, frame);
        Box::pin(async {})
    }
}

/// Hooks that ignore everything.
pub struct NoHooks;

impl AgentHooks for NoHooks {}

/// Verifies the `hello` an agent opens each socket with.
pub trait AgentAuthenticator: Send + Sync + 'static {
    fn authenticate<'a>(&'a self, hello: &'a HelloRequest) -> AuthFuture<'a>;
}

/// Fixed per-agent tokens, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl AgentAuthenticator for StaticTokens {
    fn authenticate<'a>(&'a self, hello: &'a HelloRequest) -> AuthFuture<'a> {
        let ok = self
            .tokens
            .get(&hello.agent_id)
            .is_some_and(|t| constant_time_eq(t.as_bytes(), hello.token.as_bytes()));
        Box::pin(async move { ok })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
