//! Retry pacing: a wall-clock deadline plus exponential backoff.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Absolute bound on the wall time of one caller-visible operation.
///
/// Uses the tokio clock so paused-time tests see the same time base as the
/// retry sleeps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// True iff at least `d` is left on the clock.
    pub fn has_remaining(&self, d: Duration) -> bool {
        let remaining = self.remaining();
        !remaining.is_zero() && remaining >= d
    }
}

/// Exponential backoff with equal jitter: the delay for attempt `n` is
/// drawn uniformly from `[d/2, d]` where `d = min(base * 2^n, cap)`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BackoffCalculator {
    base: Duration,
    cap: Duration,
}

impl BackoffCalculator {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        BackoffCalculator { base, cap }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let ceiling = self.base.saturating_mul(factor).min(self.cap);
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        BackoffCalculator::new(Duration::from_millis(100), Duration::from_secs(60))
    }
}
