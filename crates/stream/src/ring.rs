use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::event::StreamEvent;

/// Ordered event history bounded by both length and age.
///
/// Events are pushed with strictly increasing ids; iteration order is
/// oldest to newest.
#[derive(Debug)]
pub struct EventRing {
    buf: VecDeque<(Instant, StreamEvent)>,
    capacity: usize,
    max_age: Duration,
}

impl EventRing {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Appends an event, evicting the oldest when full.
    pub fn push(&mut self, at: Instant, event: StreamEvent) {
        self.evict_expired(at);
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back((at, event));
    }

    /// Drops everything older than the age limit.
    pub fn evict_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.buf.front() {
            if now.saturating_duration_since(*at) <= self.max_age {
                break;
            }
            self.buf.pop_front();
        }
    }

    pub fn oldest_id(&self) -> Option<u64> {
        self.buf.front().map(|(_, e)| e.id)
    }

    /// Events with `id > after`, or `None` if the ring cannot show that
    /// nothing after `after` was evicted.
    pub fn since(&self, after: u64) -> Option<Vec<StreamEvent>> {
        match self.oldest_id() {
            None => None,
            Some(oldest) if oldest > after.saturating_add(1) => None,
            Some(_) => Some(
                self.buf
                    .iter()
                    .filter(|(_, e)| e.id > after)
                    .map(|(_, e)| e.clone())
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::event::EventKind;

    fn ev(id: u64) -> StreamEvent {
        StreamEvent {
            id,
            kind: EventKind::Log,
            data: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    fn ids(events: &[StreamEvent]) -> Vec<u64> {
        events.iter().map(|e| e.id).collect()
    }

    #[test]
    fn evicts_oldest_over_capacity() {
        let now = Instant::now();
        let mut ring = EventRing::new(3, Duration::from_secs(60));
        for id in 1..=5 {
            ring.push(now, ev(id));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.oldest_id(), Some(3));
        assert_eq!(ids(&ring.since(2).unwrap()), vec![3, 4, 5]);
        assert!(ring.since(1).is_none());
    }

    #[test]
    fn since_latest_is_empty() {
        let now = Instant::now();
        let mut ring = EventRing::new(10, Duration::from_secs(60));
        for id in 1..=3 {
            ring.push(now, ev(id));
        }
        assert_eq!(ring.since(3).unwrap(), vec![]);
        assert_eq!(ids(&ring.since(0).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn evicts_by_age() {
        let start = Instant::now();
        let mut ring = EventRing::new(10, Duration::from_secs(5));
        ring.push(start, ev(1));
        ring.push(start + Duration::from_secs(3), ev(2));
        ring.evict_expired(start + Duration::from_secs(6));
        assert_eq!(ring.oldest_id(), Some(2));
        ring.evict_expired(start + Duration::from_secs(20));
        assert!(ring.is_empty());
        assert!(ring.since(1).is_none());
    }
}
