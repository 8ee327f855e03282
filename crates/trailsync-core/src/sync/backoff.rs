//! Exponential backoff between failed batches

use std::time::Duration;

/// Default delay after the first failure is twice this base
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Upper bound for the delay
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(32);

/// Doubling delay, reset to its base after a delivered batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Grow the delay after a failed batch and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}
