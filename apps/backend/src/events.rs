//! Topics the backend publishes on, and the tasks that feed them from
//! engine notifications.

use std::sync::Arc;

use canbridge_control::CommandRecord;
use canbridge_relay::GroupState;
use canbridge_stream::{EventKind, StreamManager};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Agent and dongle presence.
pub const AGENTS_TOPIC: &str = "agents";
/// Host command status transitions.
pub const COMMANDS_TOPIC: &str = "commands";

/// Relayed frames and mode changes of one group.
pub fn group_topic(group_id: &str) -> String {
    format!("group:{group_id}")
}

pub(crate) fn publish<T: Serialize>(
    streams: &StreamManager,
    topic: &str,
    kind: EventKind,
    data: &T,
) {
    match serde_json::to_value(data) {
        Ok(value) => {
            streams.publish(topic, kind, value);
        }
        Err(e) => warn!(topic, %kind, "event not serializable: {e}"),
    }
}

/// Publishes every group mode change on the group's topic.
pub async fn forward_group_states(
    streams: Arc<StreamManager>,
    mut states: broadcast::Receiver<GroupState>,
    cancel: CancellationToken,
) {
    loop {
        let state = tokio::select! {
            _ = cancel.cancelled() => return,
            r = states.recv() => match r {
                Ok(s) => s,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "group state forwarder lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        debug!(group = %state.group_id, mode = ?state.mode, "group state changed");
        publish(
            &streams,
            &group_topic(&state.group_id),
            EventKind::GroupState,
            &state,
        );
    }
}

/// Publishes command records as they start and finish.
pub async fn forward_command_status(
    streams: Arc<StreamManager>,
    mut records: broadcast::Receiver<CommandRecord>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => return,
            r = records.recv() => match r {
                Ok(rec) => rec,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "command status forwarder lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        publish(&streams, COMMANDS_TOPIC, EventKind::CommandStatus, &record);
    }
}
