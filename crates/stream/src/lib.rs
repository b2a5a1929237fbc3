//! Browser-facing event streams.
//!
//! Every topic keeps its own id counter and a ring of recent events bounded
//! by count and age. Subscribers resume with the last id they saw; if that
//! point has already fallen out of the ring they get one `stream_reset`
//! event instead of a partial history.
//!
//! CAN frames are the only high-rate event kind, so each topic runs a rate
//! governor that samples them down when they arrive faster than a threshold.

mod event;
mod governor;
mod manager;
mod ring;

pub use event::{EventKind, StreamEvent, parse_last_event_id};
pub use governor::RateGovernor;
pub use manager::{StreamConfig, StreamManager, Subscription};
pub use ring::EventRing;
