//! Exponential backoff.

use crate::config::DEFAULT_BACKOFF_CAP;
use std::time::Duration;

/// Exponential backoff counter.
///
/// The n-th interval (0-based) is `min(cap, base * 2^n)`. No jitter is
/// applied. Not shared: each owner keeps its own counter.
#[derive(Debug, Clone)]
pub struct BackoffCounter {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl BackoffCounter {
    /// Creates a counter with the default cap.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: DEFAULT_BACKOFF_CAP,
            attempt: 0,
        }
    }

    /// Sets the maximum interval.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Returns the next interval and advances the attempt count.
    pub fn next_interval(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let interval = self
            .base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        interval
    }

    /// Returns the counter to its initial state.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of intervals handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
