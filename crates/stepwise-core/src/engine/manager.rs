//! Execution manager: idempotent creation and the per-execution step loop.
//!
//! Creation is insert-then-fetch under the `(tenant_id, idempotency_key)`
//! unique index, so concurrent callers with the same key converge on one
//! row. Running walks the pinned definition's steps in order through the
//! `StepExecutor`; a step waiting on a retry parks the execution in
//! `waiting` until the poller resumes it.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use stepwise_types::audit::{AuditEvent, EXECUTION_CANCELLED, EXECUTION_CREATED};
use stepwise_types::definition::{Definition, DefinitionStatus};
use stepwise_types::dlq::DlqEntry;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{Execution, ExecutionStatus, StepExecution, StepStatus, Target};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::repository::Store;

use super::error::EngineError;
use super::step_executor::StepExecutor;

/// Actor recorded on audit events when the caller does not name one.
pub const SYSTEM_ACTOR: &str = "system";

/// Parameters for `create_execution` beyond the definition itself.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub target: Target,
    pub input_data: serde_json::Value,
    /// Derived from tenant, definition code and target when absent.
    pub idempotency_key: Option<String>,
    /// A fresh UUID when absent.
    pub correlation_id: Option<String>,
    pub actor: Option<String>,
}

impl NewExecution {
    pub fn new(target: Target, input_data: serde_json::Value) -> Self {
        Self {
            target,
            input_data,
            idempotency_key: None,
            correlation_id: None,
            actor: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Deterministic key for requests that do not supply one:
/// `auto:` + hex SHA-256 of `tenant|code|target_type|target_id`.
pub fn derive_idempotency_key(tenant_id: &str, code: &str, target: &Target) -> String {
    let mut hasher = Sha256::new();
    let parts = [
        tenant_id,
        code,
        target.target_type.as_str(),
        target.target_id.as_str(),
    ];
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("auto:{hex}")
}

pub struct ExecutionManager<S: Store> {
    store: Arc<S>,
    executor: StepExecutor<S>,
    audit: Arc<dyn AuditSink>,
}

impl<S: Store> ExecutionManager<S> {
    pub fn new(store: Arc<S>, executor: StepExecutor<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            executor,
            audit,
        }
    }

    pub fn executor(&self) -> &StepExecutor<S> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create (or return the existing) execution for an idempotency key.
    #[tracing::instrument(skip(self, definition, request), fields(code = %definition.code, version = definition.version))]
    pub async fn create_execution(
        &self,
        tenant_id: &str,
        definition: &Definition,
        request: NewExecution,
    ) -> Result<Execution, EngineError> {
        EngineError::check_tenant(tenant_id, &definition.tenant_id)?;
        if definition.status != DefinitionStatus::Published {
            return Err(EngineError::DefinitionNotPublished {
                code: definition.code.clone(),
                version: definition.version,
                status: definition.status,
            });
        }

        let idempotency_key = match request.idempotency_key {
            Some(key) => key,
            None => derive_idempotency_key(tenant_id, &definition.code, &request.target),
        };

        let now = Utc::now();
        let execution = Execution {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.to_string(),
            definition_code: definition.code.clone(),
            definition_version: definition.version,
            status: ExecutionStatus::Pending,
            target_type: request.target.target_type,
            target_id: request.target.target_id,
            input_data: request.input_data,
            idempotency_key,
            correlation_id: request
                .correlation_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        if self.store.insert_execution(&execution).await? {
            tracing::info!(execution_id = %execution.id, "created execution");
            self.audit.emit(AuditEvent::new(
                EXECUTION_CREATED,
                request.actor.as_deref().unwrap_or(SYSTEM_ACTOR),
                "execution",
                execution.id.to_string(),
                serde_json::json!({
                    "tenant_id": tenant_id,
                    "definition_code": execution.definition_code,
                    "definition_version": execution.definition_version,
                    "idempotency_key": execution.idempotency_key,
                }),
            ));
            return Ok(execution);
        }

        let existing = self
            .store
            .get_execution_by_key(tenant_id, &execution.idempotency_key)
            .await?
            .ok_or_else(|| {
                RepositoryError::Conflict(format!(
                    "execution key '{}' conflicted but no row was found",
                    execution.idempotency_key
                ))
            })?;
        tracing::debug!(execution_id = %existing.id, "idempotency key matched existing execution");
        Ok(existing)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Drive an execution through its steps until it completes, fails, waits
    /// on a retry or finds a step owned by another worker.
    #[tracing::instrument(skip(self))]
    pub async fn run_execution(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Execution, EngineError> {
        let execution = self.require_execution(tenant_id, execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(execution);
        }

        let definition = self
            .store
            .get_definition(
                tenant_id,
                &execution.definition_code,
                execution.definition_version,
            )
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                code: execution.definition_code.clone(),
                version: execution.definition_version,
            })?;

        if execution.status != ExecutionStatus::Running
            && !self
                .set_status(tenant_id, execution_id, ExecutionStatus::Running)
                .await?
        {
            return self.require_execution(tenant_id, execution_id).await;
        }

        for step in &definition.steps {
            let current = self.require_execution(tenant_id, execution_id).await?;
            if current.status.is_terminal() {
                tracing::info!(status = %current.status, "execution stopped before step {}", step.step_id);
                return Ok(current);
            }

            let attempt = match self
                .executor
                .execute_step(tenant_id, &current, &definition, step)
                .await
            {
                Ok(attempt) => attempt,
                Err(EngineError::ExecutionNotActive { .. }) => {
                    return self.require_execution(tenant_id, execution_id).await;
                }
                Err(e) => return Err(e),
            };

            match attempt.status {
                StepStatus::Succeeded | StepStatus::Skipped => continue,
                StepStatus::Retrying => {
                    self.set_status(tenant_id, execution_id, ExecutionStatus::Waiting)
                        .await?;
                    return self.require_execution(tenant_id, execution_id).await;
                }
                StepStatus::Failed => {
                    self.set_status(tenant_id, execution_id, ExecutionStatus::Failed)
                        .await?;
                    return self.require_execution(tenant_id, execution_id).await;
                }
                StepStatus::Pending | StepStatus::Running => {
                    tracing::debug!(step_id = %step.step_id, "step owned by another worker");
                    return self.require_execution(tenant_id, execution_id).await;
                }
            }
        }

        self.set_status(tenant_id, execution_id, ExecutionStatus::Completed)
            .await?;
        tracing::info!("execution completed");
        self.require_execution(tenant_id, execution_id).await
    }

    /// Cancel a non-terminal execution. Already-cancelled executions are
    /// returned as-is; completed or failed ones are left untouched.
    pub async fn cancel_execution(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        actor: Option<&str>,
    ) -> Result<Execution, EngineError> {
        let execution = self.require_execution(tenant_id, execution_id).await?;
        match execution.status {
            ExecutionStatus::Cancelled => return Ok(execution),
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                return Err(EngineError::ExecutionNotActive {
                    execution_id,
                    status: execution.status,
                });
            }
            _ => {}
        }

        if self
            .set_status(tenant_id, execution_id, ExecutionStatus::Cancelled)
            .await?
        {
            tracing::info!(execution_id = %execution_id, "cancelled execution");
            self.audit.emit(AuditEvent::new(
                EXECUTION_CANCELLED,
                actor.unwrap_or(SYSTEM_ACTOR),
                "execution",
                execution_id.to_string(),
                serde_json::json!({
                    "tenant_id": tenant_id,
                    "previous_status": execution.status.as_str(),
                }),
            ));
        }

        let current = self.require_execution(tenant_id, execution_id).await?;
        match current.status {
            ExecutionStatus::Cancelled => Ok(current),
            status => Err(EngineError::ExecutionNotActive {
                execution_id,
                status,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<Execution>, EngineError> {
        Ok(self.store.get_execution(tenant_id, &execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        tenant_id: &str,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self.store.list_executions(tenant_id, status, limit).await?)
    }

    pub async fn list_step_executions(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, EngineError> {
        self.require_execution(tenant_id, execution_id).await?;
        Ok(self.store.list_step_attempts(&execution_id).await?)
    }

    pub async fn list_dlq_entries(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, EngineError> {
        self.executor.dlq().list_dlq_entries(tenant_id, limit).await
    }

    async fn require_execution(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Execution, EngineError> {
        self.store
            .get_execution(tenant_id, &execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<bool, EngineError> {
        Ok(self
            .store
            .update_execution_status(tenant_id, &execution_id, status, Utc::now())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_key_is_stable_and_scoped() {
        let target = Target::new("order", "ord_123");
        let a = derive_idempotency_key("acme", "order-confirmation", &target);
        let b = derive_idempotency_key("acme", "order-confirmation", &target);
        assert_eq!(a, b);
        assert!(a.starts_with("auto:"));
        assert_eq!(a.len(), "auto:".len() + 64);

        let other_tenant = derive_idempotency_key("globex", "order-confirmation", &target);
        assert_ne!(a, other_tenant);
        let other_target =
            derive_idempotency_key("acme", "order-confirmation", &Target::new("order", "ord_124"));
        assert_ne!(a, other_target);
    }

    #[test]
    fn test_derived_key_separates_fields() {
        let a = derive_idempotency_key("ab", "c", &Target::new("t", "1"));
        let b = derive_idempotency_key("a", "bc", &Target::new("t", "1"));
        assert_ne!(a, b);
    }
}
