//! Maps handler failures onto the fixed `ErrorClass` taxonomy.
//!
//! Classification is a pure function of the error value. Structured variants
//! map directly; free-form `Other` messages fall back to keyword matching,
//! and anything unrecognised is `RETRYABLE`.

use std::sync::LazyLock;

use regex::Regex;
use stepwise_types::retry::ErrorClass;

use super::handler::HandlerError;
use super::redact::Redactor;

const TIMEOUT_SIGNALS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const RATE_LIMIT_SIGNALS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "throttl",
];

/// A 429 only counts when it reads as a status code, not as part of an id.
#[allow(clippy::expect_used)]
static RATE_LIMIT_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:http(?:/\d(?:\.\d)?)?|status|code)[\s:=]*429\b")
        .expect("constant regex pattern is valid")
});

const NON_RETRYABLE_SIGNALS: &[&str] = &[
    "validation",
    "invalid",
    "permission",
    "forbidden",
    "unauthorized",
    "access denied",
    "not allowed",
];

const NETWORK_SIGNALS: &[&str] = &[
    "connection",
    "network",
    "refused",
    "reset by peer",
    "unreachable",
    "broken pipe",
    "dns",
];

/// A handler failure after classification and redaction. This is what gets
/// persisted on the attempt; the raw error never is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedHandlerError {
    pub class: ErrorClass,
    pub summary: String,
}

impl ClassifiedHandlerError {
    pub fn from_error(err: &HandlerError, redactor: &Redactor) -> Self {
        Self {
            class: classify(err),
            summary: redactor.redact(&err.to_string()),
        }
    }
}

/// Classify a handler failure.
pub fn classify(err: &HandlerError) -> ErrorClass {
    match err {
        HandlerError::Timeout(_) => ErrorClass::Transient,
        HandlerError::RateLimited { .. } => ErrorClass::RateLimited,
        HandlerError::Http { status, .. } => classify_status(*status),
        HandlerError::Validation(_) | HandlerError::PermissionDenied(_) => {
            ErrorClass::NonRetryable
        }
        HandlerError::Network(_) => ErrorClass::Transient,
        HandlerError::Dependency(_) => ErrorClass::DependencyFailed,
        HandlerError::CompensationRequired(_) => ErrorClass::CompensationRequired,
        HandlerError::Other(message) => classify_message(message),
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 => ErrorClass::Transient,
        400..=499 => ErrorClass::NonRetryable,
        502..=504 => ErrorClass::DependencyFailed,
        500..=599 => ErrorClass::Retryable,
        _ => ErrorClass::Retryable,
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let has = |signals: &[&str]| signals.iter().any(|s| lower.contains(s));

    if has(TIMEOUT_SIGNALS) {
        ErrorClass::Transient
    } else if has(RATE_LIMIT_SIGNALS) || RATE_LIMIT_STATUS.is_match(&lower) {
        ErrorClass::RateLimited
    } else if has(NON_RETRYABLE_SIGNALS) {
        ErrorClass::NonRetryable
    } else if has(NETWORK_SIGNALS) {
        ErrorClass::Transient
    } else {
        ErrorClass::Retryable
    }
}
