//! Attempt budget and exponential backoff.

use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(2_000),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `base * 2^(attempt - 1)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exp)
    }

    /// `attempt` counts the attempt that just failed.
    #[must_use]
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.backoff(attempt),
            }
        }
    }
}

impl From<&chatrelay_config::RetryConfig> for RetryPolicy {
    fn from(cfg: &chatrelay_config::RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(1, 2_000)]
    #[case(2, 4_000)]
    #[case(3, 8_000)]
    #[case(5, 32_000)]
    fn backoff_doubles(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(attempt), Duration::from_millis(expected_ms));
    }

    #[rstest]
    #[case(1, RetryDecision::Retry { delay: Duration::from_millis(2_000) })]
    #[case(2, RetryDecision::Retry { delay: Duration::from_millis(4_000) })]
    #[case(3, RetryDecision::Exhausted)]
    #[case(7, RetryDecision::Exhausted)]
    fn three_attempts_then_exhausted(#[case] attempt: u32, #[case] expected: RetryDecision) {
        assert_eq!(RetryPolicy::default().decide(attempt), expected);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            backoff_base: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(65_536));
    }

    #[test]
    fn from_config_never_allows_zero_attempts() {
        let cfg = chatrelay_config::RetryConfig {
            max_attempts: 0,
            backoff_base_ms: 100,
        };
        let policy = RetryPolicy::from(&cfg);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.decide(1), RetryDecision::Exhausted);
    }
}
