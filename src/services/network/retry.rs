//! Stepped backoff between full connection passes.
//!
//! The delay is recomputed from the attempt count on every failure: a short
//! delay until the plateau is reached, then a constant long delay.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub short_delay: Duration,
    pub long_delay: Duration,
    pub plateau_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            short_delay: Duration::from_secs(5),
            long_delay: Duration::from_secs(60),
            plateau_after: 5,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        if attempt_count < self.plateau_after {
            self.short_delay
        } else {
            self.long_delay
        }
    }
}

/// Owned exclusively by the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub next_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt_count: 0,
            next_delay: policy.delay_for(0),
        }
    }

    pub fn reset(&mut self, policy: &RetryPolicy) {
        *self = Self::new(policy);
    }

    /// Account for one failed pass over all saved networks.
    ///
    /// Returns true when the retry budget is spent. The count never exceeds
    /// `max_retries`.
    pub fn record_failed_pass(&mut self, policy: &RetryPolicy) -> bool {
        self.attempt_count = (self.attempt_count + 1).min(policy.max_retries);
        self.next_delay = policy.delay_for(self.attempt_count);
        self.attempt_count >= policy.max_retries
    }
}
