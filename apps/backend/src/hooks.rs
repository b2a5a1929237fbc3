//! Backend reactions to agent activity.

use std::sync::Arc;

use canbridge_control::{AgentHooks, HookFuture};
use canbridge_protocol::messages::{DongleLostReport, DongleSightingReport, Heartbeat};
use canbridge_protocol::{CanFrameRelay, ChannelKind};
use canbridge_relay::{BufferKey, RelayEngine, RelayOutcome};
use canbridge_stream::{EventKind, StreamManager};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::directory::DongleDirectory;
use crate::events::{AGENTS_TOPIC, group_topic, publish};

pub struct BackendHooks {
    relay: Arc<RelayEngine>,
    streams: Arc<StreamManager>,
    directory: Arc<DongleDirectory>,
}

impl BackendHooks {
    pub fn new(
        relay: Arc<RelayEngine>,
        streams: Arc<StreamManager>,
        directory: Arc<DongleDirectory>,
    ) -> Self {
        Self {
            relay,
            streams,
            directory,
        }
    }

    fn agent_presence(&self, agent_id: &str, kind: ChannelKind, online: bool) {
        publish(
            &self.streams,
            AGENTS_TOPIC,
            EventKind::Presence,
            &json!({ "agent_id": agent_id, "channel": kind, "online": online }),
        );
    }
}

impl AgentHooks for BackendHooks {
    fn on_connected<'a>(&'a self, agent_id: &'a str, kind: ChannelKind) -> HookFuture<'a> {
        Box::pin(async move {
            self.agent_presence(agent_id, kind, true);
            // Relay delivery needs the data socket, so only it counts as online.
            if kind == ChannelKind::Data {
                match self.relay.on_agent_connected(agent_id).await {
                    Ok(0) => {}
                    Ok(n) => info!(agent = agent_id, replayed = n, "buffered frames delivered"),
                    Err(e) => warn!(agent = agent_id, "replay failed: {e}"),
                }
            }
        })
    }

    fn on_disconnected<'a>(&'a self, agent_id: &'a str, kind: ChannelKind) -> HookFuture<'a> {
        Box::pin(async move {
            self.agent_presence(agent_id, kind, false);
            if kind == ChannelKind::Data {
                self.relay.on_agent_disconnected(agent_id);
            }
        })
    }

    fn on_heartbeat<'a>(&'a self, agent_id: &'a str, heartbeat: Heartbeat) -> HookFuture<'a> {
        Box::pin(async move {
            debug!(agent = agent_id, uptime = heartbeat.uptime_secs, dongles = heartbeat.dongles.len(), "heartbeat");
            for dongle in &heartbeat.dongles {
                self.directory.assign(dongle, agent_id);
            }
        })
    }

    fn on_sighting<'a>(
        &'a self,
        agent_id: &'a str,
        report: DongleSightingReport,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            self.directory.assign(&report.dongle_id, agent_id);
            publish(
                &self.streams,
                AGENTS_TOPIC,
                EventKind::Presence,
                &json!({ "agent_id": agent_id, "dongle": report, "online": true }),
            );
        })
    }

    fn on_dongle_lost<'a>(&'a self, agent_id: &'a str, report: DongleLostReport) -> HookFuture<'a> {
        Box::pin(async move {
            // The assignment stays so frames for it keep buffering.
            publish(
                &self.streams,
                AGENTS_TOPIC,
                EventKind::Presence,
                &json!({ "agent_id": agent_id, "dongle_id": report.dongle_id, "online": false }),
            );
        })
    }

    fn on_frame<'a>(&'a self, agent_id: &'a str, frame: CanFrameRelay) -> HookFuture<'a> {
        Box::pin(async move {
            let observed = frame.clone();
            let group_id = match self.relay.handle_frame(agent_id, frame).await {
                Ok(
                    RelayOutcome::Delivered { group_id, .. }
                    | RelayOutcome::Buffered {
                        key: BufferKey { group_id, .. },
                    },
                ) => group_id,
                Ok(RelayOutcome::Dropped(_)) => return,
                Err(e) => {
                    warn!(agent = agent_id, "relay failed: {e}");
                    return;
                }
            };
            let topic = group_topic(&group_id);
            let event = CanFrameRelay {
                group_id: Some(group_id),
                ..observed
            };
            publish(&self.streams, &topic, EventKind::CanFrame, &event);
        })
    }
}
