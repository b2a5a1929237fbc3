use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Trailing-window rate tracker that decides which CAN frames to keep.
#[derive(Debug)]
pub struct RateGovernor {
    window: Duration,
    threshold: u32,
    stamps: VecDeque<Instant>,
    factor: u32,
    seen: u64,
}

/// Result of offering one frame to the governor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub admit: bool,
    /// `(previous, current)` when the sampling factor just changed.
    pub factor_change: Option<(u32, u32)>,
    pub rate: f64,
}

impl RateGovernor {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            stamps: VecDeque::new(),
            factor: 1,
            seen: 0,
        }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Records a frame at `now` and decides whether it is emitted.
    pub fn offer(&mut self, now: Instant) -> Admission {
        self.stamps.push_back(now);
        while let Some(front) = self.stamps.front() {
            if now.saturating_duration_since(*front) < self.window {
                break;
            }
            self.stamps.pop_front();
        }

        let rate = self.stamps.len() as f64 / self.window.as_secs_f64();
        let factor = ((rate / f64::from(self.threshold)).ceil() as u32).max(1);
        let factor_change = (factor != self.factor).then(|| {
            let previous = self.factor;
            self.factor = factor;
            self.seen = 0;
            (previous, factor)
        });

        let admit = self.seen % u64::from(self.factor) == 0;
        self.seen += 1;
        Admission {
            admit,
            factor_change,
            rate,
        }
    }
}
