//! Dead-letter routing for terminal step failures.

use std::sync::Arc;

use chrono::Utc;
use stepwise_types::dlq::{DlqEntry, DlqReason};
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{Execution, StepExecution};
use stepwise_types::retry::ErrorClass;
use uuid::Uuid;

use crate::repository::DlqRepository;

use super::error::EngineError;

/// Why a terminal attempt is dead-lettered. Exhausted attempts win over the
/// error class.
pub fn dlq_reason(attempt_number: u32, max_attempts: u32, class: ErrorClass) -> DlqReason {
    if attempt_number >= max_attempts {
        DlqReason::MaxRetriesExceeded
    } else {
        match class {
            ErrorClass::NonRetryable => DlqReason::NonRetryableError,
            ErrorClass::CompensationRequired => DlqReason::CompensationRequired,
            _ => DlqReason::TimeoutExceeded,
        }
    }
}

pub struct DlqRouter<R: DlqRepository> {
    repo: Arc<R>,
}

impl<R: DlqRepository> Clone for DlqRouter<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
        }
    }
}

impl<R: DlqRepository> DlqRouter<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Persist one DLQ entry for a terminal attempt. Routing the same attempt
    /// again returns the entry that already exists.
    #[tracing::instrument(
        skip(self, execution, step_execution),
        fields(execution_id = %execution.id, step_id = %step_execution.step_id)
    )]
    pub async fn route_to_dlq(
        &self,
        tenant_id: &str,
        execution: &Execution,
        step_execution: &StepExecution,
        error_class: ErrorClass,
        max_attempts: u32,
    ) -> Result<DlqEntry, EngineError> {
        EngineError::check_tenant(tenant_id, &execution.tenant_id)?;
        EngineError::check_tenant(tenant_id, &step_execution.tenant_id)?;
        if step_execution.execution_id != execution.id {
            return Err(EngineError::ExecutionNotFound(step_execution.execution_id));
        }

        let entry = DlqEntry {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.to_string(),
            execution_id: execution.id,
            step_execution_id: step_execution.id,
            step_id: step_execution.step_id.clone(),
            attempt_number: step_execution.attempt_number,
            reason: dlq_reason(step_execution.attempt_number, max_attempts, error_class),
            error_class,
            error_summary: step_execution.error_summary.clone(),
            created_at: Utc::now(),
        };

        if self.repo.insert_dlq_entry(&entry).await? {
            tracing::warn!(
                attempt = entry.attempt_number,
                reason = %entry.reason,
                error_class = %entry.error_class,
                "step routed to dead-letter queue"
            );
            return Ok(entry);
        }

        tracing::debug!("dead-letter entry already exists");
        self.repo
            .get_dlq_entry_for_attempt(&step_execution.id)
            .await?
            .ok_or(EngineError::Repository(RepositoryError::NotFound))
    }

    pub async fn list_dlq_entries(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, EngineError> {
        Ok(self.repo.list_dlq_entries(tenant_id, limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use stepwise_types::execution::{ExecutionStatus, StepStatus};

    fn execution() -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::now_v7(),
            tenant_id: "acme".into(),
            definition_code: "welcome".into(),
            definition_version: 1,
            status: ExecutionStatus::Running,
            target_type: "user".into(),
            target_id: "u-1".into(),
            input_data: serde_json::json!({}),
            idempotency_key: "k".into(),
            correlation_id: "c".into(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn failed_attempt(exec: &Execution, attempt: u32) -> StepExecution {
        let mut row = StepExecution::new_attempt(exec, "send", attempt, Utc::now());
        row.status = StepStatus::Failed;
        row.error_summary = Some("boom".into());
        row
    }

    #[test]
    fn test_reason_precedence() {
        assert_eq!(
            dlq_reason(3, 3, ErrorClass::NonRetryable),
            DlqReason::MaxRetriesExceeded
        );
        assert_eq!(
            dlq_reason(1, 3, ErrorClass::NonRetryable),
            DlqReason::NonRetryableError
        );
        assert_eq!(
            dlq_reason(1, 3, ErrorClass::CompensationRequired),
            DlqReason::CompensationRequired
        );
        assert_eq!(dlq_reason(1, 3, ErrorClass::Transient), DlqReason::TimeoutExceeded);
    }

    #[tokio::test]
    async fn test_route_twice_returns_same_entry() {
        let store = Arc::new(InMemoryStore::new());
        let router = DlqRouter::new(Arc::clone(&store));
        let exec = execution();
        let attempt = failed_attempt(&exec, 1);

        let first = router
            .route_to_dlq("acme", &exec, &attempt, ErrorClass::NonRetryable, 3)
            .await
            .unwrap();
        let second = router
            .route_to_dlq("acme", &exec, &attempt, ErrorClass::NonRetryable, 3)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.reason, DlqReason::NonRetryableError);
        assert_eq!(first.error_summary.as_deref(), Some("boom"));
        assert_eq!(router.list_dlq_entries("acme", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_rejects_foreign_tenant() {
        let store = Arc::new(InMemoryStore::new());
        let router = DlqRouter::new(store);
        let exec = execution();
        let attempt = failed_attempt(&exec, 1);
        let err = router
            .route_to_dlq("globex", &exec, &attempt, ErrorClass::Retryable, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TenantMismatch { .. }));
    }
}
