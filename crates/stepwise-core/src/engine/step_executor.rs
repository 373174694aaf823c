//! Step executor: runs one attempt of one step.
//!
//! # Attempt flow
//!
//! 1. Resolve the handler (fails before any row is written).
//! 2. Re-read the execution; terminal executions never get new attempts.
//! 3. Get-or-create the current attempt under the
//!    `(execution_id, step_id, attempt_number)` unique index. A lost insert
//!    race re-reads the latest attempt and decides again.
//! 4. Claim it (`pending -> running`, conditional).
//! 5. Invoke the handler on the bounded worker pool with a timeout.
//! 6. Record success, or classify + redact the failure and either schedule a
//!    retry or mark it failed and route it to the DLQ.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepwise_types::config::EngineConfig;
use stepwise_types::definition::{Definition, StepDef};
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{Execution, StepExecution, StepStatus};
use stepwise_types::retry::{ErrorClass, RetryPolicy};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::repository::{DlqRepository, ExecutionRepository, StepOutcome};

use super::classify::ClassifiedHandlerError;
use super::dlq::DlqRouter;
use super::error::EngineError;
use super::handler::{BoxHandler, ExecutionContext, HandlerError, HandlerRegistry};
use super::redact::Redactor;
use super::retry::{RetryDecision, RetryPlanner};

/// Bound on re-read/re-decide rounds after lost races. Each lost round means
/// another worker made progress, so this is only reached under pathological
/// contention.
const MAX_ACQUIRE_ROUNDS: u32 = 16;

enum Acquired {
    /// This worker claimed the attempt and must run it.
    Run(StepExecution),
    /// Nothing to run; return the attempt as observed.
    Existing(StepExecution),
}

pub struct StepExecutor<R: ExecutionRepository + DlqRepository + 'static> {
    repo: Arc<R>,
    registry: Arc<HandlerRegistry>,
    dlq: DlqRouter<R>,
    redactor: Redactor,
    workers: Arc<Semaphore>,
    default_timeout: Duration,
}

impl<R: ExecutionRepository + DlqRepository + 'static> StepExecutor<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<HandlerRegistry>,
        config: &EngineConfig,
        redactor: Redactor,
    ) -> Self {
        Self {
            dlq: DlqRouter::new(Arc::clone(&repo)),
            repo,
            registry,
            redactor,
            workers: Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1))),
            default_timeout: Duration::from_millis(config.default_step_timeout_ms),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn dlq(&self) -> &DlqRouter<R> {
        &self.dlq
    }

    /// Run (or observe) the current attempt of `step` for `execution`.
    ///
    /// Returns the attempt as it stands afterwards. Handler failures are
    /// recorded on the attempt and never returned as `Err`.
    pub async fn execute_step(
        &self,
        tenant_id: &str,
        execution: &Execution,
        definition: &Definition,
        step: &StepDef,
    ) -> Result<StepExecution, EngineError> {
        EngineError::check_tenant(tenant_id, &execution.tenant_id)?;
        EngineError::check_tenant(tenant_id, &definition.tenant_id)?;

        let handler = self.registry.resolve(step)?;
        let policy = definition.effective_policy(step);

        let span = tracing::info_span!(
            "stepwise.step",
            execution_id = %execution.id,
            step_id = %step.step_id,
            step_type = %step.step_type,
            attempt = tracing::field::Empty,
        );

        self.execute_step_in_span(tenant_id, execution, step, &policy, handler)
            .instrument(span)
            .await
    }

    async fn execute_step_in_span(
        &self,
        tenant_id: &str,
        execution: &Execution,
        step: &StepDef,
        policy: &RetryPolicy,
        handler: BoxHandler,
    ) -> Result<StepExecution, EngineError> {
        let attempt = match self.acquire_attempt(tenant_id, execution, step, policy).await? {
            Acquired::Run(attempt) => attempt,
            Acquired::Existing(attempt) => {
                tracing::debug!(
                    attempt = attempt.attempt_number,
                    status = %attempt.status,
                    "no attempt to run"
                );
                return Ok(attempt);
            }
        };
        tracing::Span::current().record("attempt", attempt.attempt_number);
        self.run_attempt(tenant_id, execution, step, policy, handler, attempt)
            .await
    }

    // -----------------------------------------------------------------------
    // Get-or-create
    // -----------------------------------------------------------------------

    async fn acquire_attempt(
        &self,
        tenant_id: &str,
        execution: &Execution,
        step: &StepDef,
        policy: &RetryPolicy,
    ) -> Result<Acquired, EngineError> {
        for _ in 0..MAX_ACQUIRE_ROUNDS {
            let current = self
                .repo
                .get_execution(tenant_id, &execution.id)
                .await?
                .ok_or(EngineError::ExecutionNotFound(execution.id))?;
            let latest = self
                .repo
                .latest_step_attempt(&execution.id, &step.step_id)
                .await?;

            if current.status.is_terminal() {
                return match latest {
                    Some(row) => Ok(Acquired::Existing(row)),
                    None => Err(EngineError::ExecutionNotActive {
                        execution_id: current.id,
                        status: current.status,
                    }),
                };
            }

            let now = Utc::now();
            let next_number = match latest {
                None => 1,
                Some(row) => match row.status {
                    StepStatus::Succeeded | StepStatus::Skipped | StepStatus::Running => {
                        return Ok(Acquired::Existing(row));
                    }
                    StepStatus::Failed => {
                        let class = row.error_class.unwrap_or(ErrorClass::Retryable);
                        self.dlq
                            .route_to_dlq(tenant_id, &current, &row, class, policy.max_attempts)
                            .await?;
                        return Ok(Acquired::Existing(row));
                    }
                    StepStatus::Retrying if !row.is_due(now) => {
                        return Ok(Acquired::Existing(row));
                    }
                    StepStatus::Retrying => row.attempt_number + 1,
                    StepStatus::Pending => {
                        if let Some(claimed) = self.claim(row, now).await? {
                            return Ok(Acquired::Run(claimed));
                        }
                        continue;
                    }
                },
            };

            let fresh = StepExecution::new_attempt(&current, &step.step_id, next_number, now);
            if self.repo.insert_step_attempt(&fresh).await? {
                tracing::debug!(attempt = next_number, "created step attempt");
                if let Some(claimed) = self.claim(fresh, now).await? {
                    return Ok(Acquired::Run(claimed));
                }
            } else {
                tracing::debug!(attempt = next_number, "lost attempt insert race; re-reading");
            }
        }

        Err(EngineError::Repository(RepositoryError::Conflict(format!(
            "could not acquire an attempt for step '{}' of execution {}",
            step.step_id, execution.id
        ))))
    }

    async fn claim(
        &self,
        mut row: StepExecution,
        now: DateTime<Utc>,
    ) -> Result<Option<StepExecution>, EngineError> {
        if self.repo.claim_step_attempt(&row.id, now).await? {
            row.status = StepStatus::Running;
            row.started_at = Some(now);
            Ok(Some(row))
        } else {
            Ok(None)
        }
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    async fn run_attempt(
        &self,
        tenant_id: &str,
        execution: &Execution,
        step: &StepDef,
        policy: &RetryPolicy,
        handler: BoxHandler,
        mut attempt: StepExecution,
    ) -> Result<StepExecution, EngineError> {
        let ctx = ExecutionContext {
            tenant_id: tenant_id.to_string(),
            execution_id: execution.id,
            definition_code: execution.definition_code.clone(),
            definition_version: execution.definition_version,
            target: execution.target(),
            input_data: execution.input_data.clone(),
            correlation_id: execution.correlation_id.clone(),
            step_id: step.step_id.clone(),
            attempt_number: attempt.attempt_number,
        };
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let result = self
            .invoke(handler, step.clone(), ctx, attempt.idempotency_key.clone(), timeout)
            .await;
        let now = Utc::now();

        let outcome = match result {
            Ok(result_data) => {
                tracing::info!(attempt = attempt.attempt_number, "step attempt succeeded");
                StepOutcome::Succeeded {
                    result_data,
                    finished_at: now,
                }
            }
            Err(err) => {
                let failure = ClassifiedHandlerError::from_error(&err, &self.redactor);
                match RetryPlanner::decide(
                    policy,
                    attempt.attempt_number,
                    failure.class,
                    err.retry_after(),
                ) {
                    RetryDecision::Retry { delay } => {
                        let retry_after_at = chrono::Duration::from_std(delay)
                            .ok()
                            .and_then(|d| now.checked_add_signed(d))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC);
                        tracing::warn!(
                            attempt = attempt.attempt_number,
                            error_class = %failure.class,
                            error = %failure.summary,
                            delay_ms = delay.as_millis() as u64,
                            "step attempt failed; retry scheduled"
                        );
                        StepOutcome::Retrying {
                            error_class: failure.class,
                            error_summary: failure.summary,
                            retry_after_at,
                            finished_at: now,
                        }
                    }
                    RetryDecision::DeadLetter => {
                        tracing::warn!(
                            attempt = attempt.attempt_number,
                            error_class = %failure.class,
                            error = %failure.summary,
                            "step attempt failed terminally"
                        );
                        StepOutcome::Failed {
                            error_class: failure.class,
                            error_summary: failure.summary,
                            finished_at: now,
                        }
                    }
                }
            }
        };

        if !self.repo.record_step_outcome(&attempt.id, &outcome).await? {
            tracing::warn!(
                attempt = attempt.attempt_number,
                "attempt was no longer running when recording its outcome"
            );
            return self
                .repo
                .get_step_attempt(&attempt.id)
                .await?
                .ok_or(EngineError::Repository(RepositoryError::NotFound));
        }
        outcome.apply_to(&mut attempt);

        if let StepOutcome::Failed { error_class, .. } = outcome {
            self.dlq
                .route_to_dlq(tenant_id, execution, &attempt, error_class, policy.max_attempts)
                .await?;
        }

        Ok(attempt)
    }

    /// Run the handler on its own task, bounded by the worker pool and the
    /// timeout. Panics surface as `HandlerError::Other`.
    async fn invoke(
        &self,
        handler: BoxHandler,
        step: StepDef,
        ctx: ExecutionContext,
        idempotency_key: String,
        timeout: Duration,
    ) -> Result<serde_json::Value, HandlerError> {
        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| HandlerError::other("handler worker pool is closed"))?;

        let task = tokio::spawn(
            async move {
                let _permit = permit;
                tokio::time::timeout(timeout, handler.handle_boxed(&step, &ctx, &idempotency_key))
                    .await
            }
            .in_current_span(),
        );

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(HandlerError::Timeout(timeout)),
            Err(join_err) if join_err.is_panic() => Err(HandlerError::other("handler panicked")),
            Err(join_err) => Err(HandlerError::other(format!("handler task failed: {join_err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stepwise_types::definition::{DefinitionStatus, StepParams, StepType};
    use stepwise_types::execution::ExecutionStatus;
    use stepwise_types::retry::{BackoffStrategy, RetryPolicy};
    use uuid::Uuid;

    use super::*;
    use crate::engine::handler::Handler;
    use crate::repository::InMemoryStore;

    struct FailingHandler {
        calls: Arc<AtomicU32>,
        error: HandlerError,
    }

    impl Handler for FailingHandler {
        async fn handle(
            &self,
            _step: &StepDef,
            _ctx: &ExecutionContext,
            _key: &str,
        ) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    struct EchoHandler;

    impl Handler for EchoHandler {
        async fn handle(
            &self,
            _step: &StepDef,
            ctx: &ExecutionContext,
            key: &str,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::json!({ "key": key, "attempt": ctx.attempt_number }))
        }
    }

    struct PanickingHandler;

    impl Handler for PanickingHandler {
        async fn handle(
            &self,
            _step: &StepDef,
            _ctx: &ExecutionContext,
            _key: &str,
        ) -> Result<serde_json::Value, HandlerError> {
            panic!("handler bug");
        }
    }

    struct SlowHandler;

    impl Handler for SlowHandler {
        async fn handle(
            &self,
            _step: &StepDef,
            _ctx: &ExecutionContext,
            _key: &str,
        ) -> Result<serde_json::Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        }
    }

    fn definition(timeout_ms: Option<u64>) -> Definition {
        Definition {
            tenant_id: "acme".into(),
            code: "welcome".into(),
            version: 1,
            description: None,
            steps: vec![StepDef {
                step_id: "refund".into(),
                step_type: StepType::Custom,
                handler_name: Some("billing.refund".into()),
                params: StepParams::Custom {
                    payload: serde_json::Value::Null,
                },
                retry: None,
                timeout_ms,
                extra: BTreeMap::new(),
            }],
            policy: RetryPolicy {
                max_attempts: 3,
                backoff_strategy: BackoffStrategy::Fixed,
                initial_delay_ms: 0,
                max_delay_ms: 0,
                ..RetryPolicy::default()
            },
            status: DefinitionStatus::Published,
            published_at: Some(Utc::now()),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    async fn seeded_execution(store: &InMemoryStore) -> Execution {
        let now = Utc::now();
        let exec = Execution {
            id: Uuid::now_v7(),
            tenant_id: "acme".into(),
            definition_code: "welcome".into(),
            definition_version: 1,
            status: ExecutionStatus::Running,
            target_type: "order".into(),
            target_id: "o-1".into(),
            input_data: serde_json::json!({}),
            idempotency_key: "order-o-1".into(),
            correlation_id: "corr".into(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        store.insert_execution(&exec).await.unwrap();
        exec
    }

    fn executor<H: Handler + 'static>(
        store: Arc<InMemoryStore>,
        handler: H,
    ) -> StepExecutor<InMemoryStore> {
        let registry = HandlerRegistry::new().with_custom("billing.refund", handler);
        StepExecutor::new(
            store,
            Arc::new(registry),
            &EngineConfig::default(),
            Redactor::default(),
        )
    }

    #[tokio::test]
    async fn test_success_records_result_and_key() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let executor = executor(Arc::clone(&store), EchoHandler);

        let attempt = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(attempt.status, StepStatus::Succeeded);
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(
            attempt.result_data.unwrap()["key"],
            "order-o-1:refund:1"
        );
    }

    #[tokio::test]
    async fn test_replay_of_succeeded_step_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let executor = executor(Arc::clone(&store), EchoHandler);

        let first = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        let replay = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(first.id, replay.id);
        assert_eq!(store.list_step_attempts(&exec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_retry() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor(
            Arc::clone(&store),
            FailingHandler {
                calls: Arc::clone(&calls),
                error: HandlerError::Network("connection reset for bob@example.com".into()),
            },
        );

        let attempt = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(attempt.status, StepStatus::Retrying);
        assert_eq!(attempt.error_class, Some(ErrorClass::Transient));
        assert_eq!(
            attempt.error_summary.as_deref(),
            Some("network error: connection reset for [EMAIL]")
        );
        assert!(attempt.retry_after_at.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_goes_to_dlq_once() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let calls = Arc::new(AtomicU32::new(0));
        let executor = executor(
            Arc::clone(&store),
            FailingHandler {
                calls: Arc::clone(&calls),
                error: HandlerError::Validation("bad amount".into()),
            },
        );

        let attempt = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(attempt.status, StepStatus::Failed);

        // Re-submitting a failed step re-routes idempotently and runs nothing.
        let again = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(again.id, attempt.id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_dlq_entries("acme", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(Some(20));
        let executor = executor(Arc::clone(&store), SlowHandler);

        let attempt = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(attempt.status, StepStatus::Retrying);
        assert_eq!(attempt.error_class, Some(ErrorClass::Transient));
    }

    #[tokio::test]
    async fn test_panic_is_recorded_not_propagated() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let executor = executor(Arc::clone(&store), PanickingHandler);

        let attempt = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap();
        assert_eq!(attempt.status, StepStatus::Retrying);
        assert_eq!(attempt.error_class, Some(ErrorClass::Retryable));
        assert_eq!(attempt.error_summary.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn test_missing_handler_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let executor = StepExecutor::new(
            Arc::clone(&store),
            Arc::new(HandlerRegistry::new()),
            &EngineConfig::default(),
            Redactor::default(),
        );

        let err = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::HandlerNotRegistered(_)));
        assert!(store.list_step_attempts(&exec.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_execution_gets_no_attempt() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        store
            .update_execution_status("acme", &exec.id, ExecutionStatus::Cancelled, Utc::now())
            .await
            .unwrap();
        let def = definition(None);
        let executor = executor(Arc::clone(&store), EchoHandler);

        let err = executor
            .execute_step("acme", &exec, &def, &def.steps[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionNotActive { .. }));
        assert!(store.list_step_attempts(&exec.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_tenant_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let exec = seeded_execution(&store).await;
        let def = definition(None);
        let executor = executor(Arc::clone(&store), EchoHandler);
        let err = executor
            .execute_step("globex", &exec, &def, &def.steps[0])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TenantMismatch { .. }));
    }
}
