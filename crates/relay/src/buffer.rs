use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use canbridge_protocol::CanFrameRelay;
use chrono::{DateTime, Utc};

use crate::RelayError;
use crate::group::Direction;

pub const DEFAULT_MAX_BUFFERED: usize = 1000;

pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RelayError>> + Send + 'a>>;

/// Addresses one group's buffer in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub group_id: String,
    pub direction: Direction,
}

impl BufferKey {
    pub fn new(group_id: impl Into<String>, direction: Direction) -> Self {
        Self {
            group_id: group_id.into(),
            direction,
        }
    }

    /// Stable name for external logs, e.g. `relay:g1:a_to_b`.
    pub fn stream_name(&self) -> String {
        format!("relay:{}:{}", self.group_id, self.direction)
    }
}

/// One buffered frame and its position in the log. Sequence numbers only
/// grow within a key, so trimming never changes what a sequence refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedFrame {
    pub seq: u64,
    pub frame: CanFrameRelay,
}

/// Durable append-only log that trims its oldest entries on write.
pub trait DurableLog: Send + Sync {
    fn append<'a>(&'a self, key: &'a BufferKey, frame: CanFrameRelay) -> LogFuture<'a, ()>;

    /// Everything buffered for `key`, oldest first.
    fn read_all<'a>(&'a self, key: &'a BufferKey) -> LogFuture<'a, Vec<BufferedFrame>>;

    /// Number of entries still buffered for `key`.
    fn backlog<'a>(&'a self, key: &'a BufferKey) -> LogFuture<'a, usize>;

    /// Drops every entry up to and including `through` once delivered.
    fn ack<'a>(&'a self, key: &'a BufferKey, through: u64) -> LogFuture<'a, ()>;
}

/// Records when a dongle was last heard from.
pub trait LastSeenStore: Send + Sync {
    fn touch<'a>(&'a self, dongle_id: &'a str, at: DateTime<Utc>) -> LogFuture<'a, ()>;
}

/// In-process log used when no external stream store is configured, and in
/// tests. Survives agent reconnects but not a backend restart.
pub struct MemoryLog {
    max_len: usize,
    entries: Mutex<HashMap<BufferKey, Stream>>,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    frames: VecDeque<BufferedFrame>,
}

impl MemoryLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<BufferKey, Stream>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self, key: &BufferKey) -> usize {
        self.entries().get(key).map_or(0, |s| s.frames.len())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED)
    }
}

impl DurableLog for MemoryLog {
    fn append<'a>(&'a self, key: &'a BufferKey, frame: CanFrameRelay) -> LogFuture<'a, ()> {
        let mut entries = self.entries();
        let stream = entries.entry(key.clone()).or_default();
        let seq = stream.next_seq;
        stream.next_seq += 1;
        stream.frames.push_back(BufferedFrame { seq, frame });
        while stream.frames.len() > self.max_len {
            stream.frames.pop_front();
        }
        Box::pin(async { Ok(()) })
    }

    fn read_all<'a>(&'a self, key: &'a BufferKey) -> LogFuture<'a, Vec<BufferedFrame>> {
        let frames: Vec<_> = self
            .entries()
            .get(key)
            .map(|s| s.frames.iter().cloned().collect())
            .unwrap_or_default();
        Box::pin(async move { Ok(frames) })
    }

    fn backlog<'a>(&'a self, key: &'a BufferKey) -> LogFuture<'a, usize> {
        let n = self.len(key);
        Box::pin(async move { Ok(n) })
    }

    fn ack<'a>(&'a self, key: &'a BufferKey, through: u64) -> LogFuture<'a, ()> {
        let mut entries = self.entries();
        if let Some(stream) = entries.get_mut(key) {
            while stream.frames.front().is_some_and(|f| f.seq <= through) {
                stream.frames.pop_front();
            }
        }
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
pub struct MemoryLastSeen {
    seen: Mutex<HashMap<String, (DateTime<Utc>, u64)>>,
}

impl MemoryLastSeen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self, dongle_id: &str) -> Option<DateTime<Utc>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dongle_id)
            .map(|(at, _)| *at)
    }

    /// How many writes reached the store for this dongle.
    pub fn writes(&self, dongle_id: &str) -> u64 {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dongle_id)
            .map_or(0, |(_, n)| *n)
    }
}

impl LastSeenStore for MemoryLastSeen {
    fn touch<'a>(&'a self, dongle_id: &'a str, at: DateTime<Utc>) -> LogFuture<'a, ()> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = seen.entry(dongle_id.to_string()).or_insert((at, 0));
        entry.0 = at;
        entry.1 += 1;
        Box::pin(async { Ok(()) })
    }
}
