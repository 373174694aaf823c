//! Execution and step-attempt records.
//!
//! An `Execution` is one durable run of a pinned definition version against a
//! target. Each try at a step is a separate `StepExecution` row: failures
//! produce new attempts instead of mutating old ones.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseEnumError;
use crate::retry::ErrorClass;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What an execution acts on (e.g. `order` / `ord_123`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub target_type: String,
    pub target_id: String,
}

impl Target {
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: target_id.into(),
        }
    }
}

/// One durable, idempotently created run of a definition version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    pub tenant_id: String,
    pub definition_code: String,
    pub definition_version: u32,
    pub status: ExecutionStatus,
    pub target_type: String,
    pub target_id: String,
    pub input_data: serde_json::Value,
    /// Unique per tenant.
    pub idempotency_key: String,
    /// Opaque ID propagated to every step for tracing.
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn target(&self) -> Target {
        Target::new(self.target_type.clone(), self.target_id.clone())
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// A step is waiting for its retry to become due.
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Waiting,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("execution status", s))
    }
}

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// One attempt at running a single step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub step_id: String,
    /// 1-based, strictly increasing per `(execution_id, step_id)`.
    pub attempt_number: u32,
    pub status: StepStatus,
    /// Key handed to the handler so it can dedupe side effects.
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Redacted, bounded failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set while `status == retrying`: the earliest time the next attempt may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Build a fresh `pending` attempt row.
    pub fn new_attempt(
        execution: &Execution,
        step_id: &str,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: execution.tenant_id.clone(),
            execution_id: execution.id,
            step_id: step_id.to_string(),
            attempt_number,
            status: StepStatus::Pending,
            idempotency_key: attempt_idempotency_key(
                &execution.idempotency_key,
                step_id,
                attempt_number,
            ),
            error_class: None,
            error_summary: None,
            result_data: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            retry_after_at: None,
        }
    }

    /// A `retrying` attempt whose `retry_after_at` has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Retrying && self.retry_after_at.is_none_or(|at| at <= now)
    }
}

/// Per-attempt idempotency key: `{execution_key}:{step_id}:{attempt}`.
pub fn attempt_idempotency_key(execution_key: &str, step_id: &str, attempt_number: u32) -> String {
    format!("{execution_key}:{step_id}:{attempt_number}")
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

impl StepStatus {
    pub const ALL: [StepStatus; 6] = [
        StepStatus::Pending,
        StepStatus::Running,
        StepStatus::Succeeded,
        StepStatus::Failed,
        StepStatus::Retrying,
        StepStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Retrying => "retrying",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Succeeded and skipped rows are never mutated again.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepStatus::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("step status", s))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
