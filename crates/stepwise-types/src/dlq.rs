//! Dead-letter queue entries.
//!
//! One entry per terminal step failure, written once and never updated.
//! Entries reference the failed attempt rather than embedding it so they
//! survive independently for audit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseEnumError;
use crate::retry::ErrorClass;

/// Why a step attempt ended up in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxRetriesExceeded,
    NonRetryableError,
    CompensationRequired,
    TimeoutExceeded,
}

impl DlqReason {
    pub const ALL: [DlqReason; 4] = [
        DlqReason::MaxRetriesExceeded,
        DlqReason::NonRetryableError,
        DlqReason::CompensationRequired,
        DlqReason::TimeoutExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::MaxRetriesExceeded => "max_retries_exceeded",
            DlqReason::NonRetryableError => "non_retryable_error",
            DlqReason::CompensationRequired => "compensation_required",
            DlqReason::TimeoutExceeded => "timeout_exceeded",
        }
    }
}

impl fmt::Display for DlqReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DlqReason::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("dlq reason", s))
    }
}

/// A terminal step failure awaiting operator triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub execution_id: Uuid,
    /// Unique: at most one entry per failed attempt.
    pub step_execution_id: Uuid,
    pub step_id: String,
    pub attempt_number: u32,
    pub reason: DlqReason,
    pub error_class: ErrorClass,
    /// Already redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}
