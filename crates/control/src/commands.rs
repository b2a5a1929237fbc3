//! Host commands run by agents on the backend's behalf.
//!
//! A command is acknowledged over the control channel, then reports output
//! chunks and one terminal response out of band. Its timeout is independent
//! of the request timeout because execution can outlast a round trip.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use canbridge_protocol::MessageType;
use canbridge_protocol::messages::{
    CommandChunk, CommandExecAck, CommandExecRequest, CommandOutcome, CommandResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ControlError;
use crate::manager::ConnectionManager;

/// Output kept per command; later chunks only set `truncated`.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Finished commands kept for lookup; the oldest go first. Running commands
/// are never evicted.
const DEFAULT_RETAINED_COMMANDS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPolicy {
    pub name: String,
    pub max_args: usize,
    #[serde(with = "secs")]
    pub timeout: Duration,
}

/// Commands an agent may be asked to run, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CommandAllowlist {
    policies: HashMap<String, CommandPolicy>,
}

impl CommandAllowlist {
    pub fn new(policies: impl IntoIterator<Item = CommandPolicy>) -> Self {
        Self {
            policies: policies.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    /// Validates a command and returns the policy that applies.
    pub fn check(&self, command: &str, args: &[String]) -> Result<&CommandPolicy, ControlError> {
        let policy = self
            .policies
            .get(command)
            .ok_or_else(|| ControlError::CommandNotAllowed(command.to_string()))?;
        if args.len() > policy.max_args {
            return Err(ControlError::TooManyArgs {
                command: command.to_string(),
                max: policy.max_args,
                got: args.len(),
            });
        }
        Ok(policy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub agent_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
}

#[derive(Default)]
struct Records {
    by_id: HashMap<String, CommandRecord>,
    /// Terminal command ids, oldest first.
    finished: VecDeque<String>,
}

struct Inner {
    allowlist: CommandAllowlist,
    retain: usize,
    records: Mutex<Records>,
    events: broadcast::Sender<CommandRecord>,
}

impl Inner {
    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to a running command and publishes the result if it
    /// became terminal. Terminal commands are left untouched.
    fn update(
        &self,
        command_id: &str,
        agent_id: Option<&str>,
        f: impl FnOnce(&mut CommandRecord),
    ) -> Option<CommandRecord> {
        let snapshot = {
            let mut records = self.records();
            let record = records.by_id.get_mut(command_id)?;
            if record.status.is_terminal() || agent_id.is_some_and(|a| a != record.agent_id) {
                return None;
            }
            f(record);
            if record.status.is_terminal() {
                record.finished_at = Some(SystemTime::now());
            }
            let snapshot = record.clone();
            if snapshot.status.is_terminal() {
                records.finished.push_back(snapshot.command_id.clone());
                while records.finished.len() > self.retain {
                    if let Some(old) = records.finished.pop_front() {
                        records.by_id.remove(&old);
                    }
                }
            }
            snapshot
        };
        if snapshot.status.is_terminal() {
            info!(command = %snapshot.command_id, agent = %snapshot.agent_id, status = ?snapshot.status, "command finished");
            let _ = self.events.send(snapshot.clone());
        }
        Some(snapshot)
    }
}

/// Tracks commands from dispatch to their terminal state.
#[derive(Clone)]
pub struct CommandTracker {
    inner: Arc<Inner>,
}

impl CommandTracker {
    pub fn new(allowlist: CommandAllowlist) -> Self {
        Self::with_retention(allowlist, DEFAULT_RETAINED_COMMANDS)
    }

    /// Keeps at most `retain` finished commands available to [`get`](Self::get).
    pub fn with_retention(allowlist: CommandAllowlist, retain: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                allowlist,
                retain,
                records: Mutex::new(Records::default()),
                events,
            }),
        }
    }

    /// Status transitions (`running` and every terminal state).
    pub fn subscribe(&self) -> broadcast::Receiver<CommandRecord> {
        self.inner.events.subscribe()
    }

    pub fn get(&self, command_id: &str) -> Option<CommandRecord> {
        self.inner.records().by_id.get(command_id).cloned()
    }

    /// Validates and dispatches a command to an agent.
    ///
    /// Returns once the agent has acknowledged it; output and the final
    /// status arrive later through [`on_chunk`](Self::on_chunk) and
    /// [`on_response`](Self::on_response).
    pub async fn execute(
        &self,
        manager: &ConnectionManager,
        agent_id: &str,
        command: &str,
        args: Vec<String>,
    ) -> Result<CommandRecord, ControlError> {
        let timeout = self.inner.allowlist.check(command, &args)?.timeout;
        let command_id = uuid::Uuid::new_v4().to_string();

        let record = CommandRecord {
            command_id: command_id.clone(),
            agent_id: agent_id.to_string(),
            command: command.to_string(),
            args: args.clone(),
            status: CommandStatus::Running,
            exit_code: None,
            output: String::new(),
            truncated: false,
            error: None,
            started_at: SystemTime::now(),
            finished_at: None,
        };
        self.inner
            .records()
            .by_id
            .insert(command_id.clone(), record.clone());
        let _ = self.inner.events.send(record.clone());

        let request = CommandExecRequest {
            command_id: command_id.clone(),
            command: command.to_string(),
            args,
            timeout_secs: timeout.as_secs().max(1),
        };
        let ack: Result<CommandExecAck, ControlError> = manager
            .call(agent_id, MessageType::CommandExec, &request)
            .await;
        if let Err(e) = ack {
            warn!(command = %command_id, agent = agent_id, error = %e, "command dispatch failed");
            self.inner.update(&command_id, None, |r| {
                r.status = CommandStatus::Failed;
                r.error = Some(e.to_string());
            });
            return Err(e);
        }

        let inner = Arc::clone(&self.inner);
        let id = command_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if inner
                .update(&id, None, |r| {
                    r.status = CommandStatus::TimedOut;
                    r.error = Some(format!("no result within {}s", timeout.as_secs()));
                })
                .is_some()
            {
                warn!(command = %id, "command timed out");
            }
        });

        Ok(self.get(&command_id).unwrap_or(record))
    }

    /// Appends streamed output. No-op for unknown or finished commands.
    pub fn on_chunk(&self, agent_id: &str, chunk: &CommandChunk) -> bool {
        let applied = self.inner.update(&chunk.command_id, Some(agent_id), |r| {
            let room = MAX_OUTPUT_BYTES.saturating_sub(r.output.len());
            if chunk.data.len() <= room {
                r.output.push_str(&chunk.data);
            } else {
                let mut cut = room;
                while !chunk.data.is_char_boundary(cut) {
                    cut -= 1;
                }
                r.output.push_str(&chunk.data[..cut]);
                r.truncated = true;
            }
        });
        if applied.is_none() {
            debug!(command = %chunk.command_id, "chunk for unknown or finished command ignored");
        }
        applied.is_some()
    }

    /// Records the terminal response. No-op for unknown or finished commands.
    pub fn on_response(&self, agent_id: &str, response: &CommandResponse) -> bool {
        self.inner
            .update(&response.command_id, Some(agent_id), |r| {
                r.status = match response.outcome {
                    CommandOutcome::Completed => CommandStatus::Completed,
                    CommandOutcome::Failed => CommandStatus::Failed,
                    CommandOutcome::TimedOut => CommandStatus::TimedOut,
                };
                r.exit_code = response.exit_code;
                r.error = response.error.clone();
            })
            .is_some_and(|r| r.status.is_terminal())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use canbridge_protocol::messages::OutputStream;
    use canbridge_protocol::{ChannelKind, ControlMessage};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connection::Outbound;

    fn allowlist() -> CommandAllowlist {
        CommandAllowlist::new([
            CommandPolicy {
                name: "candump".into(),
                max_args: 2,
                timeout: Duration::from_secs(30),
            },
            CommandPolicy {
                name: "uptime".into(),
                max_args: 0,
                timeout: Duration::from_secs(5),
            },
        ])
    }

    /// Registers a fake agent that acknowledges every `command_exec`.
    fn acking_agent(mgr: &Arc<ConnectionManager>) {
        let (tx, mut rx) = mpsc::channel::<WsMessage>(16);
        mgr.register("a1", ChannelKind::Control, Outbound::new(tx), CancellationToken::new());
        let m = Arc::clone(mgr);
        tokio::spawn(async move {
            while let Some(WsMessage::Text(t)) = rx.recv().await {
                let req = ControlMessage::from_json(&t).unwrap();
                let body: CommandExecRequest = req.parse_payload().unwrap().unwrap();
                let ack = req
                    .reply(
                        MessageType::CommandExecAck,
                        Some(&CommandExecAck {
                            command_id: body.command_id,
                        }),
                    )
                    .unwrap();
                m.resolve("a1", ack);
            }
        });
    }

    #[test]
    fn allowlist_enforces_name_and_args() {
        let list = allowlist();
        assert!(list.check("candump", &["can0".into()]).is_ok());
        assert!(matches!(
            list.check("rm", &[]),
            Err(ControlError::CommandNotAllowed(_))
        ));
        assert!(matches!(
            list.check("uptime", &["-p".into()]),
            Err(ControlError::TooManyArgs { max: 0, got: 1, .. })
        ));
    }

    #[tokio::test]
    async fn rejected_command_never_reaches_agent() {
        let mgr = ConnectionManager::default();
        let tracker = CommandTracker::new(allowlist());
        let err = tracker
            .execute(&mgr, "a1", "reboot", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::CommandNotAllowed(_)));
        assert_eq!(mgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn chunks_then_response() {
        let mgr = Arc::new(ConnectionManager::default());
        acking_agent(&mgr);
        let tracker = CommandTracker::new(allowlist());

        let rec = tracker
            .execute(&mgr, "a1", "candump", vec!["can0".into()])
            .await
            .unwrap();
        assert_eq!(rec.status, CommandStatus::Running);

        let chunk = |data: &str| CommandChunk {
            command_id: rec.command_id.clone(),
            stream: OutputStream::Stdout,
            data: data.into(),
        };
        assert!(tracker.on_chunk("a1", &chunk("line1\n")));
        assert!(tracker.on_chunk("a1", &chunk("line2\n")));

        let done = CommandResponse {
            command_id: rec.command_id.clone(),
            outcome: CommandOutcome::Completed,
            exit_code: Some(0),
            error: None,
        };
        assert!(tracker.on_response("a1", &done));

        let rec = tracker.get(&rec.command_id).unwrap();
        assert_eq!(rec.status, CommandStatus::Completed);
        assert_eq!(rec.output, "line1\nline2\n");
        assert_eq!(rec.exit_code, Some(0));
        assert!(rec.finished_at.is_some());

        // Late arrivals after the terminal state are ignored.
        assert!(!tracker.on_chunk("a1", &chunk("late")));
        assert!(!tracker.on_response("a1", &done));
        assert_eq!(tracker.get(&rec.command_id).unwrap().output, "line1\nline2\n");
    }

    #[tokio::test(start_paused = true)]
    async fn independent_timeout_fires() {
        let mgr = Arc::new(ConnectionManager::default());
        acking_agent(&mgr);
        let tracker = CommandTracker::new(allowlist());
        let mut events = tracker.subscribe();

        let rec = tracker
            .execute(&mgr, "a1", "uptime", vec![])
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().status, CommandStatus::Running);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let timed_out = events.recv().await.unwrap();
        assert_eq!(timed_out.status, CommandStatus::TimedOut);
        assert_eq!(tracker.get(&rec.command_id).unwrap().status, CommandStatus::TimedOut);

        // A response after the timeout does not resurrect it.
        let late = CommandResponse {
            command_id: rec.command_id.clone(),
            outcome: CommandOutcome::Completed,
            exit_code: Some(0),
            error: None,
        };
        assert!(!tracker.on_response("a1", &late));
    }

    #[tokio::test]
    async fn output_is_capped() {
        let mgr = Arc::new(ConnectionManager::default());
        acking_agent(&mgr);
        let tracker = CommandTracker::new(allowlist());
        let rec = tracker
            .execute(&mgr, "a1", "candump", vec![])
            .await
            .unwrap();
        let big = "x".repeat(MAX_OUTPUT_BYTES + 10);
        tracker.on_chunk(
            "a1",
            &CommandChunk {
                command_id: rec.command_id.clone(),
                stream: OutputStream::Stderr,
                data: big,
            },
        );
        let rec = tracker.get(&rec.command_id).unwrap();
        assert_eq!(rec.output.len(), MAX_OUTPUT_BYTES);
        assert!(rec.truncated);
    }

    #[tokio::test]
    async fn finished_commands_are_evicted_oldest_first() {
        let mgr = Arc::new(ConnectionManager::default());
        acking_agent(&mgr);
        let tracker = CommandTracker::with_retention(allowlist(), 2);

        let running = tracker
            .execute(&mgr, "a1", "candump", vec![])
            .await
            .unwrap();
        let mut finished = Vec::new();
        for _ in 0..3 {
            let rec = tracker
                .execute(&mgr, "a1", "uptime", vec![])
                .await
                .unwrap();
            assert!(tracker.on_response(
                "a1",
                &CommandResponse {
                    command_id: rec.command_id.clone(),
                    outcome: CommandOutcome::Completed,
                    exit_code: Some(0),
                    error: None,
                },
            ));
            finished.push(rec.command_id);
        }

        assert!(tracker.get(&finished[0]).is_none());
        assert!(tracker.get(&finished[1]).is_some());
        assert!(tracker.get(&finished[2]).is_some());
        assert_eq!(tracker.get(&running.command_id).unwrap().status, CommandStatus::Running);
    }

    #[tokio::test]
    async fn dispatch_to_offline_agent_fails_record() {
        let mgr = ConnectionManager::default();
        let tracker = CommandTracker::new(allowlist());
        let mut events = tracker.subscribe();
        let err = tracker
            .execute(&mgr, "a1", "uptime", vec![])
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(events.recv().await.unwrap().status, CommandStatus::Running);
        assert_eq!(events.recv().await.unwrap().status, CommandStatus::Failed);
    }
}
