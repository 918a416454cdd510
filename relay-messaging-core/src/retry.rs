// relay-messaging-core/src/retry.rs
use std::time::Duration;

use crate::config::DEFAULT_CONNECTION_CLOSED_RETRY;

pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 5;
pub const DEFAULT_PUBLISH_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Linear backoff for broker-level publish failures: after failed attempt `n`
/// the publisher waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for PublishRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            base_delay: DEFAULT_PUBLISH_BACKOFF,
        }
    }
}

impl PublishRetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Consecutive publish failures of one publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempt_count: u32,
    max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records a failure; returns the attempt number that just failed.
    pub fn record_failure(&mut self) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_count
    }

    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

/// Reconnect budget of a consume loop: `retries` reconnects, `delay` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_CONNECTION_CLOSED_RETRY,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let policy = PublishRetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(180));
    }

    #[test]
    fn retry_state_exhausts_at_the_ceiling() {
        let mut state = RetryState::new(5);
        for expected in 1..5 {
            assert_eq!(state.record_failure(), expected);
            assert!(!state.exhausted());
        }
        assert_eq!(state.record_failure(), 5);
        assert!(state.exhausted());

        state.reset();
        assert_eq!(state.attempt_count(), 0);
    }
}
