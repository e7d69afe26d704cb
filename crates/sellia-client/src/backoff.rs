//! Reconnect backoff: linear, capped, reset on successful auth
//! (`spec.md` §4.10).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    step: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            current: Duration::ZERO,
        }
    }

    /// The delay to wait before the next reconnect attempt, then advances
    /// by one step (capped at `max`).
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.step).min(self.max);
        delay
    }

    /// Resets to zero delay, called after a connection successfully
    /// authenticates.
    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
