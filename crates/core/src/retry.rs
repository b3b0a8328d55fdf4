//! Retry policy for extraction attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between attempts.
///
/// The attempt budget lives on each [`Job`](crate::Job) as `max_attempts`;
/// this only decides how long to wait before the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff base
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// A base above the cap is clamped to the cap.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay: base_delay.min(max_delay),
            max_delay,
        }
    }

    /// Delay before redelivering a job that has used `attempt_count` attempts:
    /// `base * 2^attempt_count`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(300));
    }

    #[test]
    fn base_above_cap_is_clamped() {
        let policy = RetryPolicy::new(Duration::from_secs(600), Duration::from_secs(120));

        assert_eq!(policy.base_delay, Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(120));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: delays never decrease with the attempt count and never
        /// exceed the cap.
        #[test]
        fn backoff_is_monotonic_and_bounded(
            base_ms in 1u64..10_000,
            cap_ms in 1u64..3_600_000,
            attempt in 0u32..64,
        ) {
            let policy = RetryPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            let now = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);

            prop_assert!(next >= now);
            prop_assert!(next <= Duration::from_millis(cap_ms));
        }
    }
}
