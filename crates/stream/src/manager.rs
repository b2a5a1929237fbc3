use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::event::{EventKind, StreamEvent};
use crate::governor::RateGovernor;
use crate::ring::EventRing;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_events: usize,
    pub max_age: Duration,
    /// CAN frames per second above which frames are sampled.
    pub can_threshold: u32,
    pub sample_window: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_events: 1000,
            max_age: Duration::from_secs(5 * 60),
            can_threshold: 200,
            sample_window: Duration::from_secs(2),
        }
    }
}

struct Topic {
    last_id: u64,
    ring: EventRing,
    governor: RateGovernor,
    subscribers: Vec<(u64, mpsc::UnboundedSender<StreamEvent>)>,
}

impl Topic {
    fn new(config: &StreamConfig) -> Self {
        Self {
            last_id: 0,
            ring: EventRing::new(config.max_events, config.max_age),
            governor: RateGovernor::new(config.sample_window, config.can_threshold),
            subscribers: Vec::new(),
        }
    }

    /// Assigns the next id, stores the event and fans it out.
    fn append(&mut self, now: Instant, kind: EventKind, data: Value) -> u64 {
        self.last_id += 1;
        let event = StreamEvent {
            id: self.last_id,
            kind,
            data,
            ts: Utc::now(),
        };
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        self.ring.push(now, event);
        self.last_id
    }

    fn reset_event(&self, requested: u64, reason: &str) -> StreamEvent {
        StreamEvent {
            id: self.last_id,
            kind: EventKind::StreamReset,
            data: json!({
                "reason": reason,
                "requested": requested,
                "oldest_available": self.ring.oldest_id(),
            }),
            ts: Utc::now(),
        }
    }
}

struct Inner {
    config: StreamConfig,
    topics: Mutex<HashMap<String, Topic>>,
    next_subscriber: Mutex<u64>,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(t) = self.topics().get_mut(topic) {
            t.subscribers.retain(|(sid, _)| *sid != id);
        }
    }
}

/// Owns every topic's log and subscriber list.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: Mutex::new(HashMap::new()),
                next_subscriber: Mutex::new(0),
            }),
        }
    }

    /// Appends an event and delivers it to current subscribers.
    ///
    /// Returns the assigned id, or `None` when a CAN frame was sampled out.
    pub fn publish(&self, topic: &str, kind: EventKind, data: Value) -> Option<u64> {
        let now = Instant::now();
        let mut topics = self.inner.topics();
        let t = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(&self.inner.config));

        if kind == EventKind::CanFrame {
            let admission = t.governor.offer(now);
            if let Some((previous, factor)) = admission.factor_change {
                info!(topic, previous, factor, rate = admission.rate, "CAN sampling factor changed");
                t.append(
                    now,
                    EventKind::Log,
                    json!({
                        "level": "warn",
                        "message": format!("CAN frame sampling is now 1 in {factor}"),
                        "sampling_factor": factor,
                        "previous_factor": previous,
                        "rate": admission.rate,
                    }),
                );
            }
            if !admission.admit {
                return None;
            }
        }
        Some(t.append(now, kind, data))
    }

    /// Registers a live subscriber, first replaying history after
    /// `last_event_id` or sending a single reset if that history is gone.
    pub fn subscribe(&self, topic: &str, last_event_id: Option<u64>) -> Subscription {
        let id = {
            let mut next = self
                .inner
                .next_subscriber
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.inner.topics();
        let t = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(&self.inner.config));
        t.ring.evict_expired(Instant::now());

        if let Some(after) = last_event_id {
            let backlog = if after > t.last_id {
                Err("unknown_id")
            } else if after == t.last_id {
                Ok(Vec::new())
            } else {
                t.ring.since(after).ok_or("history_evicted")
            };
            match backlog {
                Ok(events) => {
                    debug!(topic, after, replayed = events.len(), "resuming stream");
                    for event in events {
                        let _ = tx.send(event);
                    }
                }
                Err(reason) => {
                    debug!(topic, after, reason, "stream reset");
                    let _ = tx.send(t.reset_event(after, reason));
                }
            }
        }
        t.subscribers.push((id, tx));

        Subscription {
            id,
            topic: topic.to_string(),
            rx,
            manager: Arc::downgrade(&self.inner),
        }
    }

    pub fn last_id(&self, topic: &str) -> u64 {
        self.inner.topics().get(topic).map_or(0, |t| t.last_id)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map_or(0, |t| t.subscribers.len())
    }

    pub fn sampling_factor(&self, topic: &str) -> u32 {
        self.inner
            .topics()
            .get(topic)
            .map_or(1, |t| t.governor.factor())
    }
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    manager: Weak<Inner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// Drains everything already queued.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.unsubscribe(&self.topic, self.id);
        }
    }
}
