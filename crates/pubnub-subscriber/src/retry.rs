//! Exponential backoff for the reconnect path.

use std::time::Duration;

/// Delay sequence `initial * 2^n`, capped at `max`. Reset on any success.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next retry. Non-decreasing across calls
    /// until [`reset`](Self::reset).
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(30);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Wall-clock-derived jitter in `[0, max)`, applied at the sleep site so
    /// the deterministic delay sequence stays testable.
    pub fn jitter(max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        Duration::from_millis(nanos % max_ms)
    }
}
