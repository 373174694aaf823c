//! Retry eligibility and backoff computation.
//!
//! Stateless: all logic lives in associated functions that take the resolved
//! policy as a parameter. `attempt` is always 1-based (the first execution is
//! attempt 1).

use std::collections::BTreeSet;
use std::time::Duration;

use stepwise_types::retry::{BackoffStrategy, ErrorClass, RetryPolicy};

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule attempt `attempt + 1` no earlier than `delay` from now.
    Retry { delay: Duration },
    /// Give up and route the attempt to the DLQ.
    DeadLetter,
}

// ---------------------------------------------------------------------------
// RetryPlanner
// ---------------------------------------------------------------------------

/// Stateless retry planner for step failures.
pub struct RetryPlanner;

impl RetryPlanner {
    /// `true` iff attempts remain and the class is retryable under the policy.
    pub fn should_retry(
        attempt: u32,
        max_attempts: u32,
        class: ErrorClass,
        retry_on_classes: &BTreeSet<ErrorClass>,
    ) -> bool {
        attempt < max_attempts && retry_on_classes.contains(&class)
    }

    /// Delay before the attempt after `attempt`. Never exceeds `max_delay`.
    ///
    /// - `Fixed`: `initial_delay`
    /// - `Exponential`: `initial_delay * 2^(attempt-1)`, saturating
    /// - `Jittered`: exponential scaled by a random factor in [0.5, 1.0]
    pub fn compute_delay(
        attempt: u32,
        strategy: BackoffStrategy,
        initial_delay: Duration,
        max_delay: Duration,
    ) -> Duration {
        let delay = match strategy {
            BackoffStrategy::Fixed => initial_delay,
            BackoffStrategy::Exponential => Self::exponential(attempt, initial_delay, max_delay),
            BackoffStrategy::Jittered => Self::jittered(
                Self::exponential(attempt, initial_delay, max_delay),
                0.5 + fastrand::f64() * 0.5,
            ),
        };
        delay.min(max_delay)
    }

    /// Full decision for a classified failure. A rate-limit `retry_after`
    /// hint can only lengthen the computed delay.
    pub fn decide(
        policy: &RetryPolicy,
        attempt: u32,
        class: ErrorClass,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !Self::should_retry(attempt, policy.max_attempts, class, &policy.retry_on_classes) {
            return RetryDecision::DeadLetter;
        }
        let computed = Self::compute_delay(
            attempt,
            policy.backoff_strategy,
            policy.initial_delay(),
            policy.max_delay(),
        );
        let delay = match retry_after {
            Some(hint) => computed.max(hint),
            None => computed,
        };
        RetryDecision::Retry { delay }
    }

    fn exponential(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
        let exponent = attempt.max(1) - 1;
        2u32.checked_pow(exponent)
            .and_then(|factor| initial_delay.checked_mul(factor))
            .unwrap_or(max_delay)
    }

    /// Scale `base` by `factor`, clamped to [0.5, 1.0].
    pub fn jittered(base: Duration, factor: f64) -> Duration {
        base.mul_f64(factor.clamp(0.5, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
