//! Retry policy
//!
//! Fixed-delay, bounded retry. Business failures give up immediately;
//! transient and unknown failures are retried until the attempt budget is
//! spent.

use crate::processing::classifier::FailureKind;
use std::time::Duration;

/// Default number of handler invocations per message
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Decision for a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Constant-backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy; a budget of zero attempts is raised to one
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Decide what happens after a failed attempt
    ///
    /// `attempts_made` is the number of handler invocations for the message
    /// so far, including the one that just failed.
    pub fn decide(&self, kind: FailureKind, attempts_made: u32) -> RetryDecision {
        match kind {
            FailureKind::Business => RetryDecision::GiveUp,
            FailureKind::Transient | FailureKind::Unknown => {
                if attempts_made < self.max_attempts {
                    RetryDecision::RetryAfter(self.delay)
                } else {
                    RetryDecision::GiveUp
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn business_always_gives_up(attempts in 0u32..1000, max in 1u32..100) {
            let policy = RetryPolicy::new(max, Duration::from_millis(10));
            prop_assert_eq!(policy.decide(FailureKind::Business, attempts), RetryDecision::GiveUp);
        }

        #[test]
        fn retryable_kinds_respect_budget(attempts in 0u32..200, max in 1u32..100) {
            let policy = RetryPolicy::new(max, Duration::from_millis(10));
            for kind in [FailureKind::Transient, FailureKind::Unknown] {
                let decision = policy.decide(kind, attempts);
                if attempts < max {
                    prop_assert_eq!(decision, RetryDecision::RetryAfter(Duration::from_millis(10)));
                } else {
                    prop_assert_eq!(decision, RetryDecision::GiveUp);
                }
            }
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(), Duration::from_secs(2));

        assert_eq!(
            policy.decide(FailureKind::Transient, 1),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(FailureKind::Unknown, 2),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(policy.decide(FailureKind::Transient, 3), RetryDecision::GiveUp);
        assert_eq!(policy.decide(FailureKind::Business, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_delay_is_constant() {
        let policy = RetryPolicy::new(10, Duration::from_millis(250));
        let delays: Vec<_> = (1..10)
            .map(|attempt| policy.decide(FailureKind::Transient, attempt))
            .collect();
        assert!(delays
            .iter()
            .all(|d| *d == RetryDecision::RetryAfter(Duration::from_millis(250))));
    }

    #[test]
    fn test_zero_budget_is_single_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.decide(FailureKind::Transient, 1), RetryDecision::GiveUp);
    }
}
