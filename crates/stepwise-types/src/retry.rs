//! Error classes and retry policy types.
//!
//! `ErrorClass` is the fixed taxonomy every handler failure is bucketed into.
//! `RetryPolicy` is the fully resolved policy for one step: a definition
//! carries defaults and each step may override individual fields through
//! `RetryOverride`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Deterministic bucket for a handler failure, used to decide retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Transient,
    Retryable,
    RateLimited,
    NonRetryable,
    DependencyFailed,
    CompensationRequired,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 6] = [
        ErrorClass::Transient,
        ErrorClass::Retryable,
        ErrorClass::RateLimited,
        ErrorClass::NonRetryable,
        ErrorClass::DependencyFailed,
        ErrorClass::CompensationRequired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "TRANSIENT",
            ErrorClass::Retryable => "RETRYABLE",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::NonRetryable => "NON_RETRYABLE",
            ErrorClass::DependencyFailed => "DEPENDENCY_FAILED",
            ErrorClass::CompensationRequired => "COMPENSATION_REQUIRED",
        }
    }

    /// Classes retried when a policy does not list its own.
    pub fn default_retry_on() -> BTreeSet<ErrorClass> {
        BTreeSet::from([
            ErrorClass::Transient,
            ErrorClass::Retryable,
            ErrorClass::RateLimited,
            ErrorClass::DependencyFailed,
        ])
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorClass::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("error class", s))
    }
}

// ---------------------------------------------------------------------------
// BackoffStrategy
// ---------------------------------------------------------------------------

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `initial_delay`.
    Fixed,
    /// `initial_delay * 2^(attempt-1)`, capped at `max_delay`.
    Exponential,
    /// Exponential scaled by a random factor in [0.5, 1.0].
    Jittered,
}

// ---------------------------------------------------------------------------
// RetryPolicy / RetryOverride
// ---------------------------------------------------------------------------

/// Fully resolved retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in milliseconds (default 1000).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay in milliseconds (default 60000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "ErrorClass::default_retry_on")]
    pub retry_on_classes: BTreeSet<ErrorClass>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_strategy: default_backoff(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_on_classes: ErrorClass::default_retry_on(),
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Layer a step override on top of this policy, field by field.
    pub fn with_override(&self, ov: &RetryOverride) -> RetryPolicy {
        RetryPolicy {
            max_attempts: ov.max_attempts.unwrap_or(self.max_attempts),
            backoff_strategy: ov.backoff_strategy.unwrap_or(self.backoff_strategy),
            initial_delay_ms: ov.initial_delay_ms.unwrap_or(self.initial_delay_ms),
            max_delay_ms: ov.max_delay_ms.unwrap_or(self.max_delay_ms),
            retry_on_classes: ov
                .retry_on_classes
                .clone()
                .unwrap_or_else(|| self.retry_on_classes.clone()),
        }
    }
}

/// Per-step retry override. Unset fields fall back to the definition defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_strategy: Option<BackoffStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_classes: Option<BTreeSet<ErrorClass>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
