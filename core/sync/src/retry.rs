//! Exponential backoff for retrying failed sync runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay policy applied after a systemic sync failure.
///
/// The delay for attempt `n` (0-based) is `initial_delay × multiplier^n`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: u32,
}

impl BackoffPolicy {
    /// 30s, doubling, capped at 5 minutes.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            multiplier: 2,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.multiplier
            .checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(300));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = BackoffPolicy::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_multiplier(10);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_delays_are_monotonic() {
        let policy = BackoffPolicy::default();
        let delays: Vec<_> = (0..12).map(|n| policy.delay_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
