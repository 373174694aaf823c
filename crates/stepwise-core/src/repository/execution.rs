//! Execution and step-attempt repository trait.

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{Execution, ExecutionStatus, StepExecution};
use stepwise_types::retry::ErrorClass;
use uuid::Uuid;

/// Result written onto a `running` attempt when its handler returns.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        result_data: serde_json::Value,
        finished_at: DateTime<Utc>,
    },
    Retrying {
        error_class: ErrorClass,
        error_summary: String,
        retry_after_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        error_class: ErrorClass,
        error_summary: String,
        finished_at: DateTime<Utc>,
    },
}

impl StepOutcome {
    /// Apply this outcome to an in-memory copy of the attempt.
    pub fn apply_to(&self, attempt: &mut StepExecution) {
        use stepwise_types::execution::StepStatus;

        match self {
            StepOutcome::Succeeded {
                result_data,
                finished_at,
            } => {
                attempt.status = StepStatus::Succeeded;
                attempt.result_data = Some(result_data.clone());
                attempt.finished_at = Some(*finished_at);
            }
            StepOutcome::Retrying {
                error_class,
                error_summary,
                retry_after_at,
                finished_at,
            } => {
                attempt.status = StepStatus::Retrying;
                attempt.error_class = Some(*error_class);
                attempt.error_summary = Some(error_summary.clone());
                attempt.retry_after_at = Some(*retry_after_at);
                attempt.finished_at = Some(*finished_at);
            }
            StepOutcome::Failed {
                error_class,
                error_summary,
                finished_at,
            } => {
                attempt.status = StepStatus::Failed;
                attempt.error_class = Some(*error_class);
                attempt.error_summary = Some(error_summary.clone());
                attempt.finished_at = Some(*finished_at);
            }
        }
    }
}

/// Storage for executions and their step attempts.
pub trait ExecutionRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert unless `(tenant_id, idempotency_key)` exists. Returns `true` if
    /// this call created the row.
    fn insert_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    fn get_execution_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Newest first, optionally filtered by status.
    fn list_executions(
        &self,
        tenant_id: &str,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Set the status of a non-terminal execution. Returns `false` if the
    /// execution is missing or already terminal. Terminal targets also set
    /// `finished_at`.
    fn update_execution_status(
        &self,
        tenant_id: &str,
        execution_id: &Uuid,
        status: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step attempts
    // -----------------------------------------------------------------------

    /// Insert unless `(execution_id, step_id, attempt_number)` exists.
    /// Returns `true` if this call created the row.
    fn insert_step_attempt(
        &self,
        attempt: &StepExecution,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_step_attempt(
        &self,
        attempt_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// The attempt with the highest `attempt_number` for a step.
    fn latest_step_attempt(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// All attempts of an execution, ordered by creation then attempt number.
    fn list_step_attempts(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// `pending -> running`. Returns `false` if another worker got there first.
    fn claim_step_attempt(
        &self,
        attempt_id: &Uuid,
        started_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// `running -> succeeded | retrying | failed`. Returns `false` if the
    /// attempt was not `running`.
    fn record_step_outcome(
        &self,
        attempt_id: &Uuid,
        outcome: &StepOutcome,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Latest-per-step `retrying` attempts whose `retry_after_at <= now`,
    /// belonging to non-terminal executions, oldest deadline first.
    fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;
}
