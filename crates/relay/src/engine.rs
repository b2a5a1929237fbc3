use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use canbridge_protocol::CanFrameRelay;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::RelayError;
use crate::buffer::{BufferKey, DurableLog, LastSeenStore};
use crate::group::{Direction, Group, GroupMode, GroupState, Side};

/// Live delivery to an agent's data socket.
pub trait DataLink: Send + Sync {
    /// Hands a frame to the agent's outbound queue. Fails when the agent has
    /// no open data socket.
    fn send_frame(&self, agent_id: &str, frame: &CanFrameRelay) -> Result<(), RelayError>;
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Minimum spacing between last-seen writes for one dongle.
    pub last_seen_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            last_seen_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { agent_id: String, group_id: String },
    Buffered { key: BufferKey },
    Dropped(&'static str),
}

#[derive(Default)]
struct State {
    groups: HashMap<String, (Group, GroupState)>,
    /// dongle id -> serving agent id
    assignments: HashMap<String, String>,
    connected: HashSet<String>,
    last_seen_written: HashMap<String, Instant>,
}

impl State {
    fn side_online(&self, group: &Group, side: Side) -> bool {
        self.assignments
            .get(group.dongle(side))
            .is_some_and(|agent| self.connected.contains(agent))
    }

    /// Re-derives one group's mode; returns the new state if it changed.
    fn recompute(&mut self, group_id: &str) -> Option<GroupState> {
        let (group, current) = self.groups.get(group_id)?;
        let next = GroupState::derive(
            group,
            self.side_online(group, Side::A),
            self.side_online(group, Side::B),
        );
        if &next == current {
            return None;
        }
        if let Some(entry) = self.groups.get_mut(group_id) {
            entry.1 = next.clone();
        }
        Some(next)
    }

    fn groups_serving(&self, agent_id: &str) -> Vec<String> {
        self.groups
            .values()
            .filter(|(g, _)| {
                [Side::A, Side::B].into_iter().any(|side| {
                    self.assignments
                        .get(g.dongle(side))
                        .is_some_and(|a| a == agent_id)
                })
            })
            .map(|(g, _)| g.id.clone())
            .collect()
    }
}

struct Plan {
    key: BufferKey,
    dest_agent: Option<String>,
    outbound: CanFrameRelay,
}

pub struct RelayEngine {
    link: Arc<dyn DataLink>,
    log: Arc<dyn DurableLog>,
    last_seen: Arc<dyn LastSeenStore>,
    config: RelayConfig,
    state: Mutex<State>,
    /// Held while frames leave a buffer so live sends cannot overtake them.
    drain: AsyncMutex<()>,
    events: broadcast::Sender<GroupState>,
}

impl RelayEngine {
    pub fn new(
        link: Arc<dyn DataLink>,
        log: Arc<dyn DurableLog>,
        last_seen: Arc<dyn LastSeenStore>,
        config: RelayConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            link,
            log,
            last_seen,
            config,
            state: Mutex::new(State::default()),
            drain: AsyncMutex::new(()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Group mode changes, in the order they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupState> {
        self.events.subscribe()
    }

    fn announce(&self, changes: Vec<GroupState>) {
        for change in changes {
            info!(group = %change.group_id, mode = ?change.mode, offline = ?change.offline_side, "group state");
            let _ = self.events.send(change);
        }
    }

    pub fn add_group(&self, group: Group) {
        let id = group.id.clone();
        let change = {
            let mut state = self.state();
            // Seed with a state that can never match so the first derive is announced.
            let seed = GroupState {
                group_id: id.clone(),
                mode: GroupMode::Inactive,
                offline_side: Some(Side::A),
            };
            state.groups.insert(id.clone(), (group, seed));
            state.recompute(&id)
        };
        self.announce(change.into_iter().collect());
    }

    pub fn remove_group(&self, group_id: &str) -> bool {
        self.state().groups.remove(group_id).is_some()
    }

    /// Records which agent serves a dongle and re-derives affected groups.
    pub fn assign_dongle(&self, dongle_id: &str, agent_id: &str) {
        let changes = {
            let mut state = self.state();
            state
                .assignments
                .insert(dongle_id.to_string(), agent_id.to_string());
            let ids: Vec<String> = state
                .groups
                .values()
                .filter(|(g, _)| g.side_of(dongle_id).is_some())
                .map(|(g, _)| g.id.clone())
                .collect();
            ids.iter().filter_map(|id| state.recompute(id)).collect()
        };
        self.announce(changes);
    }

    /// Operator toggle between `INACTIVE` and live operation.
    pub fn set_enabled(&self, group_id: &str, enabled: bool) -> Result<GroupState, RelayError> {
        let (state_now, change) = {
            let mut state = self.state();
            let entry = state
                .groups
                .get_mut(group_id)
                .ok_or_else(|| RelayError::UnknownGroup(group_id.to_string()))?;
            entry.0.enabled = enabled;
            let change = state.recompute(group_id);
            let now = state
                .groups
                .get(group_id)
                .map(|(_, s)| s.clone())
                .ok_or_else(|| RelayError::UnknownGroup(group_id.to_string()))?;
            (now, change)
        };
        self.announce(change.into_iter().collect());
        Ok(state_now)
    }

    pub fn group_state(&self, group_id: &str) -> Option<GroupState> {
        self.state().groups.get(group_id).map(|(_, s)| s.clone())
    }

    pub fn groups(&self) -> Vec<(Group, GroupState)> {
        let mut all: Vec<_> = self.state().groups.values().cloned().collect();
        all.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        all
    }

    /// Routes one frame received from `agent_id`.
    pub async fn handle_frame(
        &self,
        agent_id: &str,
        frame: CanFrameRelay,
    ) -> Result<RelayOutcome, RelayError> {
        self.touch_last_seen(&frame.source_dongle_id).await;

        let plan = match self.plan(agent_id, frame) {
            Ok(plan) => plan,
            Err(reason) => {
                debug!(agent = agent_id, reason, "relay frame dropped");
                return Ok(RelayOutcome::Dropped(reason));
            }
        };

        let Some(dest) = plan.dest_agent else {
            self.log.append(&plan.key, plan.outbound).await?;
            return Ok(RelayOutcome::Buffered { key: plan.key });
        };

        let _drain = self.drain.lock().await;
        if self.log.backlog(&plan.key).await? == 0 {
            match self.link.send_frame(&dest, &plan.outbound) {
                Ok(()) => {
                    return Ok(RelayOutcome::Delivered {
                        agent_id: dest,
                        group_id: plan.key.group_id,
                    });
                }
                Err(e) => {
                    // The group mode follows connect and disconnect only; a
                    // dead socket is reported through the disconnect path.
                    debug!(agent = %dest, error = %e, "live delivery failed, buffering");
                    self.log.append(&plan.key, plan.outbound).await?;
                    return Ok(RelayOutcome::Buffered { key: plan.key });
                }
            }
        }

        // Older frames are still waiting: queue behind them and push the
        // backlog out in order.
        self.log.append(&plan.key, plan.outbound).await?;
        self.flush(&dest, &plan.key).await?;
        if self.log.backlog(&plan.key).await? == 0 {
            Ok(RelayOutcome::Delivered {
                agent_id: dest,
                group_id: plan.key.group_id,
            })
        } else {
            Ok(RelayOutcome::Buffered { key: plan.key })
        }
    }

    fn plan(&self, agent_id: &str, frame: CanFrameRelay) -> Result<Plan, &'static str> {
        let state = self.state();
        let source = frame.source_dongle_id.as_str();

        let (group, group_state) = match &frame.group_id {
            Some(id) => state.groups.get(id).ok_or("unknown group")?,
            None => state
                .groups
                .values()
                .find(|(g, _)| g.side_of(source).is_some())
                .ok_or("dongle not in any group")?,
        };
        if group_state.mode == GroupMode::Inactive {
            return Err("group inactive");
        }
        let side = group.side_of(source).ok_or("dongle not in group")?;
        if state.assignments.get(source).map(String::as_str) != Some(agent_id) {
            return Err("agent does not serve source dongle");
        }

        let direction = Direction::from_source(side);
        let target = group.dongle(direction.destination()).to_string();
        let dest_agent = state
            .assignments
            .get(&target)
            .filter(|a| state.connected.contains(*a))
            .cloned();

        Ok(Plan {
            key: BufferKey::new(group.id.clone(), direction),
            dest_agent,
            outbound: CanFrameRelay {
                group_id: Some(group.id.clone()),
                target_dongle_id: Some(target),
                ..frame
            },
        })
    }

    async fn touch_last_seen(&self, dongle_id: &str) {
        let now = Instant::now();
        let due = {
            let mut state = self.state();
            let due = state
                .last_seen_written
                .get(dongle_id)
                .is_none_or(|at| now.saturating_duration_since(*at) >= self.config.last_seen_interval);
            if due {
                state.last_seen_written.insert(dongle_id.to_string(), now);
            }
            due
        };
        if due && let Err(e) = self.last_seen.touch(dongle_id, Utc::now()).await {
            warn!(dongle = dongle_id, error = %e, "failed to record last seen");
        }
    }

    /// Marks an agent online, re-derives its groups and replays frames that
    /// were buffered for it. Returns how many frames were delivered.
    pub async fn on_agent_connected(&self, agent_id: &str) -> Result<usize, RelayError> {
        let (changes, keys) = {
            let mut state = self.state();
            state.connected.insert(agent_id.to_string());
            let ids = state.groups_serving(agent_id);
            let changes: Vec<_> = ids.iter().filter_map(|id| state.recompute(id)).collect();

            // Directions whose destination dongle this agent serves.
            let mut keys = Vec::new();
            for id in &ids {
                if let Some((g, _)) = state.groups.get(id) {
                    for direction in [Direction::AToB, Direction::BToA] {
                        let dest = g.dongle(direction.destination());
                        if state.assignments.get(dest).is_some_and(|a| a == agent_id) {
                            keys.push(BufferKey::new(id.clone(), direction));
                        }
                    }
                }
            }
            (changes, keys)
        };
        self.announce(changes);

        let _drain = self.drain.lock().await;
        let mut delivered = 0;
        for key in keys {
            let sent = self.flush(agent_id, &key).await?;
            if sent > 0 {
                info!(agent = agent_id, buffer = %key.stream_name(), replayed = sent, "buffered frames replayed");
            }
            delivered += sent;
        }
        Ok(delivered)
    }

    /// Delivers a buffered batch in order and acknowledges through the last
    /// frame that went out. Callers hold `drain`.
    async fn flush(&self, agent_id: &str, key: &BufferKey) -> Result<usize, RelayError> {
        let frames = self.log.read_all(key).await?;
        let mut sent = 0;
        let mut through = None;
        for entry in &frames {
            if let Err(e) = self.link.send_frame(agent_id, &entry.frame) {
                warn!(agent = agent_id, buffer = %key.stream_name(), error = %e, remaining = frames.len() - sent, "replay interrupted");
                break;
            }
            sent += 1;
            through = Some(entry.seq);
        }
        if let Some(seq) = through {
            self.log.ack(key, seq).await?;
        }
        Ok(sent)
    }

    pub fn on_agent_disconnected(&self, agent_id: &str) {
        let changes = {
            let mut state = self.state();
            state.connected.remove(agent_id);
            let ids = state.groups_serving(agent_id);
            ids.iter().filter_map(|id| state.recompute(id)).collect()
        };
        self.announce(changes);
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.state().connected.contains(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use canbridge_remp::CanFrame;

    use super::*;
    use crate::buffer::{MemoryLastSeen, MemoryLog};

    /// Data link that delivers only to agents marked open.
    #[derive(Default)]
    struct FakeLink {
        open: Mutex<HashSet<String>>,
        sent: Mutex<Vec<(String, CanFrameRelay)>>,
        fail_after: Mutex<Option<usize>>,
        fail_next: Mutex<usize>,
    }

    impl FakeLink {
        fn open(&self, agent: &str) {
            self.open.lock().unwrap().insert(agent.into());
        }
        fn close(&self, agent: &str) {
            self.open.lock().unwrap().remove(agent);
        }
        fn sent_to(&self, agent: &str) -> Vec<u8> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _)| a == agent)
                .map(|(_, f)| f.frame.data[0])
                .collect()
        }
    }

    impl DataLink for FakeLink {
        fn send_frame(&self, agent_id: &str, frame: &CanFrameRelay) -> Result<(), RelayError> {
            let mut fail_next = self.fail_next.lock().unwrap();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(RelayError::LinkDown(agent_id.into()));
            }
            let mut fail_after = self.fail_after.lock().unwrap();
            if let Some(n) = fail_after.as_mut() {
                if *n == 0 {
                    return Err(RelayError::LinkDown(agent_id.into()));
                }
                *n -= 1;
            }
            if !self.open.lock().unwrap().contains(agent_id) {
                return Err(RelayError::LinkDown(agent_id.into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((agent_id.into(), frame.clone()));
            Ok(())
        }
    }

    struct Harness {
        engine: RelayEngine,
        link: Arc<FakeLink>,
        log: Arc<MemoryLog>,
        seen: Arc<MemoryLastSeen>,
    }

    fn harness() -> Harness {
        let link = Arc::new(FakeLink::default());
        let log = Arc::new(MemoryLog::default());
        let seen = Arc::new(MemoryLastSeen::new());
        let engine = RelayEngine::new(link.clone(), log.clone(), seen.clone(), RelayConfig::default());
        engine.assign_dongle("da", "agent-a");
        engine.assign_dongle("db", "agent-b");
        engine.add_group(Group::new("g1", "da", "db"));
        Harness {
            engine,
            link,
            log,
            seen,
        }
    }

    async fn connect(h: &Harness, agent: &str) -> usize {
        h.link.open(agent);
        h.engine.on_agent_connected(agent).await.unwrap()
    }

    fn disconnect(h: &Harness, agent: &str) {
        h.link.close(agent);
        h.engine.on_agent_disconnected(agent);
    }

    fn from_a(n: u8) -> CanFrameRelay {
        CanFrameRelay {
            group_id: None,
            source_dongle_id: "da".into(),
            target_dongle_id: None,
            frame: CanFrame::new(0x321, false, vec![n]).unwrap(),
            ts_us: Some(u64::from(n)),
        }
    }

    fn mode(h: &Harness) -> (GroupMode, Option<Side>) {
        let s = h.engine.group_state("g1").unwrap();
        (s.mode, s.offline_side)
    }

    #[tokio::test]
    async fn live_delivery_fills_in_route() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        assert_eq!(mode(&h), (GroupMode::Active, None));

        let out = h.engine.handle_frame("agent-a", from_a(1)).await.unwrap();
        assert_eq!(
            out,
            RelayOutcome::Delivered {
                agent_id: "agent-b".into(),
                group_id: "g1".into(),
            }
        );
        let sent = h.link.sent.lock().unwrap()[0].1.clone();
        assert_eq!(sent.group_id.as_deref(), Some("g1"));
        assert_eq!(sent.target_dongle_id.as_deref(), Some("db"));
        assert_eq!(sent.ts_us, Some(1));
    }

    #[tokio::test]
    async fn offline_frames_are_replayed_once_in_order() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        disconnect(&h, "agent-b");
        assert_eq!(mode(&h), (GroupMode::Degraded, Some(Side::B)));

        for n in 1..=5 {
            let out = h.engine.handle_frame("agent-a", from_a(n)).await.unwrap();
            assert!(matches!(out, RelayOutcome::Buffered { .. }));
        }
        let key = BufferKey::new("g1", Direction::AToB);
        assert_eq!(h.log.len(&key), 5);

        let replayed = connect(&h, "agent-b").await;
        assert_eq!(replayed, 5);
        assert_eq!(h.link.sent_to("agent-b"), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.log.len(&key), 0);
        assert_eq!(mode(&h), (GroupMode::Active, None));

        // A second reconnect must not deliver them again.
        disconnect(&h, "agent-b");
        assert_eq!(connect(&h, "agent-b").await, 0);
        assert_eq!(h.link.sent_to("agent-b").len(), 5);
    }

    #[tokio::test]
    async fn failed_send_buffers_until_disconnect_is_reported() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        // Socket died without a disconnect notification yet.
        h.link.close("agent-b");

        let mut events = h.engine.subscribe();
        for n in [9, 10] {
            let out = h.engine.handle_frame("agent-a", from_a(n)).await.unwrap();
            assert!(matches!(out, RelayOutcome::Buffered { .. }));
        }
        assert_eq!(mode(&h), (GroupMode::Active, None));
        assert!(events.try_recv().is_err());

        disconnect(&h, "agent-b");
        assert_eq!(mode(&h), (GroupMode::Degraded, Some(Side::B)));
        assert_eq!(connect(&h, "agent-b").await, 2);
        assert_eq!(h.link.sent_to("agent-b"), vec![9, 10]);
    }

    #[tokio::test]
    async fn send_failure_while_connected_keeps_order_and_mode() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        // A full outbound queue rejects one frame.
        *h.link.fail_next.lock().unwrap() = 1;

        let out = h.engine.handle_frame("agent-a", from_a(1)).await.unwrap();
        assert!(matches!(out, RelayOutcome::Buffered { .. }));
        for n in 2..=3 {
            let out = h.engine.handle_frame("agent-a", from_a(n)).await.unwrap();
            assert!(matches!(out, RelayOutcome::Delivered { .. }));
        }

        assert_eq!(h.link.sent_to("agent-b"), vec![1, 2, 3]);
        assert_eq!(h.log.len(&BufferKey::new("g1", Direction::AToB)), 0);
        assert_eq!(mode(&h), (GroupMode::Active, None));
    }

    #[tokio::test]
    async fn interrupted_replay_keeps_tail() {
        let h = harness();
        connect(&h, "agent-a").await;
        for n in 1..=4 {
            h.engine.handle_frame("agent-a", from_a(n)).await.unwrap();
        }
        *h.link.fail_after.lock().unwrap() = Some(2);
        assert_eq!(connect(&h, "agent-b").await, 2);
        let key = BufferKey::new("g1", Direction::AToB);
        let left: Vec<u8> = h
            .log
            .read_all(&key)
            .await
            .unwrap()
            .iter()
            .map(|f| f.frame.frame.data[0])
            .collect();
        assert_eq!(left, vec![3, 4]);

        *h.link.fail_after.lock().unwrap() = None;
        disconnect(&h, "agent-b");
        assert_eq!(connect(&h, "agent-b").await, 2);
        assert_eq!(h.link.sent_to("agent-b"), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn mode_tracks_connections() {
        let h = harness();
        assert_eq!(mode(&h), (GroupMode::Degraded, None));
        connect(&h, "agent-b").await;
        assert_eq!(mode(&h), (GroupMode::Degraded, Some(Side::A)));
        connect(&h, "agent-a").await;
        assert_eq!(mode(&h), (GroupMode::Active, None));
        disconnect(&h, "agent-a");
        assert_eq!(mode(&h), (GroupMode::Degraded, Some(Side::A)));
        connect(&h, "agent-a").await;
        assert_eq!(mode(&h), (GroupMode::Active, None));
    }

    #[tokio::test]
    async fn inactive_group_drops_frames() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        let s = h.engine.set_enabled("g1", false).unwrap();
        assert_eq!(s.mode, GroupMode::Inactive);

        let out = h.engine.handle_frame("agent-a", from_a(1)).await.unwrap();
        assert_eq!(out, RelayOutcome::Dropped("group inactive"));
        assert!(h.link.sent_to("agent-b").is_empty());

        assert_eq!(h.engine.set_enabled("g1", true).unwrap().mode, GroupMode::Active);
        assert!(matches!(
            h.engine.set_enabled("nope", true),
            Err(RelayError::UnknownGroup(_))
        ));
    }

    #[tokio::test]
    async fn impostor_agent_is_ignored() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        let out = h.engine.handle_frame("agent-b", from_a(1)).await.unwrap();
        assert_eq!(out, RelayOutcome::Dropped("agent does not serve source dongle"));
    }

    #[tokio::test]
    async fn reverse_direction() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        let mut f = from_a(7);
        f.source_dongle_id = "db".into();
        h.engine.handle_frame("agent-b", f).await.unwrap();
        assert_eq!(h.link.sent_to("agent-a"), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_seen_writes_are_coalesced() {
        let h = harness();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        for n in 0..50 {
            h.engine.handle_frame("agent-a", from_a(n)).await.unwrap();
        }
        assert_eq!(h.seen.writes("da"), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        h.engine.handle_frame("agent-a", from_a(0)).await.unwrap();
        assert_eq!(h.seen.writes("da"), 2);
        assert!(h.seen.last_seen("da").is_some());
    }

    #[tokio::test]
    async fn group_events_announce_transitions() {
        let h = harness();
        let mut events = h.engine.subscribe();
        connect(&h, "agent-a").await;
        connect(&h, "agent-b").await;
        disconnect(&h, "agent-a");

        let modes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|s| (s.mode, s.offline_side))
            .collect();
        assert_eq!(
            modes,
            vec![
                (GroupMode::Degraded, Some(Side::B)),
                (GroupMode::Active, None),
                (GroupMode::Degraded, Some(Side::A)),
            ]
        );
    }
}
