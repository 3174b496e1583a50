//! Retry policy evaluation.
//!
//! A pure function of the policy, the attempt count and the failure: the
//! same inputs always yield the same decision, so the decider can replay it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Per-task (or per-workflow default) retry policy.
///
/// `max_attempts` counts the first execution, so `3` means one try plus two
/// retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            base_delay_seconds: 60,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffKind, base_delay_seconds: u64) -> Self {
        Self {
            max_attempts,
            backoff,
            base_delay_seconds,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, BackoffKind::Fixed, 0)
    }
}

/// What went wrong with the attempt being evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub reason: String,
    /// `false` for terminal errors reported by a worker.
    pub retryable: bool,
}

impl TaskFailure {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt `new_attempt_count` no earlier than `retry_after`
    /// from now.
    Retry {
        retry_after: Duration,
        new_attempt_count: u32,
    },
    NoRetry,
}

/// Evaluates retry policies against a configured delay ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryEvaluator {
    max_delay: Duration,
}

impl Default for RetryEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl RetryEvaluator {
    pub fn new(max_delay: Duration) -> Self {
        Self { max_delay }
    }

    /// Decide whether attempt number `attempt_count` (1-based) gets a
    /// successor.
    ///
    /// Exponential backoff waits `base * 2^(attempt_count - 1)`, linear waits
    /// `base * attempt_count`, fixed always waits `base`. Every delay is
    /// capped at the evaluator's ceiling.
    pub fn next_attempt(
        &self,
        policy: &RetryPolicy,
        attempt_count: u32,
        failure: &TaskFailure,
    ) -> RetryDecision {
        if !failure.retryable || attempt_count >= policy.max_attempts.max(1) {
            return RetryDecision::NoRetry;
        }

        let base = policy.base_delay_seconds;
        let seconds = match policy.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base.saturating_mul(u64::from(attempt_count)),
            BackoffKind::Exponential => {
                let exponent = attempt_count.saturating_sub(1).min(63);
                base.saturating_mul(1u64 << exponent)
            }
        };

        RetryDecision::Retry {
            retry_after: Duration::from_secs(seconds).min(self.max_delay),
            new_attempt_count: attempt_count + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::Retry { retry_after, .. } => retry_after,
            RetryDecision::NoRetry => panic!("expected a retry"),
        }
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        // max 3, base 1s: attempt 1 fails -> 1s, attempt 2 fails -> 2s, attempt 3 fails -> stop.
        let evaluator = RetryEvaluator::default();
        let policy = RetryPolicy::new(3, BackoffKind::Exponential, 1);
        let failure = TaskFailure::new("boom", true);

        assert_eq!(
            evaluator.next_attempt(&policy, 1, &failure),
            RetryDecision::Retry {
                retry_after: Duration::from_secs(1),
                new_attempt_count: 2
            }
        );
        assert_eq!(delay(evaluator.next_attempt(&policy, 2, &failure)), Duration::from_secs(2));
        assert_eq!(evaluator.next_attempt(&policy, 3, &failure), RetryDecision::NoRetry);
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let evaluator = RetryEvaluator::default();
        let failure = TaskFailure::new("boom", true);

        let linear = RetryPolicy::new(5, BackoffKind::Linear, 10);
        assert_eq!(delay(evaluator.next_attempt(&linear, 1, &failure)), Duration::from_secs(10));
        assert_eq!(delay(evaluator.next_attempt(&linear, 3, &failure)), Duration::from_secs(30));

        let fixed = RetryPolicy::new(5, BackoffKind::Fixed, 7);
        assert_eq!(delay(evaluator.next_attempt(&fixed, 4, &failure)), Duration::from_secs(7));
    }

    #[test]
    fn terminal_failures_are_never_retried() {
        let evaluator = RetryEvaluator::default();
        let policy = RetryPolicy::new(10, BackoffKind::Fixed, 1);
        assert_eq!(
            evaluator.next_attempt(&policy, 1, &TaskFailure::new("bad input", false)),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn delays_are_capped() {
        let evaluator = RetryEvaluator::new(Duration::from_secs(100));
        let policy = RetryPolicy::new(80, BackoffKind::Exponential, 60);
        let failure = TaskFailure::new("boom", true);
        assert_eq!(delay(evaluator.next_attempt(&policy, 70, &failure)), Duration::from_secs(100));
    }

    #[test]
    fn zero_max_attempts_means_single_try() {
        let evaluator = RetryEvaluator::default();
        let policy = RetryPolicy::new(0, BackoffKind::Fixed, 1);
        assert_eq!(
            evaluator.next_attempt(&policy, 1, &TaskFailure::new("boom", true)),
            RetryDecision::NoRetry
        );
    }
}
