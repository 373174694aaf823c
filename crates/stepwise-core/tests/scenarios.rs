//! End-to-end engine scenarios against the in-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use stepwise_core::audit::AuditSink;
use stepwise_core::engine::definition::DefinitionService;
use stepwise_core::engine::handler::{
    DelayHandler, ExecutionContext, Handler, HandlerError, HandlerRegistry,
};
use stepwise_core::engine::manager::{ExecutionManager, NewExecution};
use stepwise_core::engine::poller::RetryPoller;
use stepwise_core::engine::redact::Redactor;
use stepwise_core::engine::step_executor::StepExecutor;
use stepwise_core::engine::EngineError;
use stepwise_core::repository::{ExecutionRepository, InMemoryStore};
use stepwise_types::audit::{AuditEvent, EXECUTION_CREATED};
use stepwise_types::config::{EngineConfig, PollerConfig};
use stepwise_types::definition::{Definition, DefinitionStatus, StepDef, StepParams, StepType};
use stepwise_types::dlq::DlqReason;
use stepwise_types::execution::{ExecutionStatus, StepStatus, Target};
use stepwise_types::retry::{BackoffStrategy, ErrorClass, RetryPolicy};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Fails every call with a fixed error.
struct AlwaysFails {
    calls: Arc<AtomicU32>,
    error: HandlerError,
}

impl Handler for AlwaysFails {
    async fn handle(
        &self,
        _step: &StepDef,
        _ctx: &ExecutionContext,
        _key: &str,
    ) -> Result<serde_json::Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Err(self.error.clone())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    manager: Arc<ExecutionManager<InMemoryStore>>,
    audit: Arc<RecordingAuditSink>,
    calls: Arc<AtomicU32>,
    definition: Definition,
}

impl Harness {
    async fn new(error: HandlerError, policy: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(RecordingAuditSink::default());
        let calls = Arc::new(AtomicU32::new(0));

        let registry = Arc::new(
            HandlerRegistry::new()
                .with_builtin(StepType::Delay, DelayHandler)
                .with_custom(
                    "billing.charge",
                    AlwaysFails {
                        calls: Arc::clone(&calls),
                        error,
                    },
                ),
        );

        let definitions = DefinitionService::new(
            Arc::clone(&store),
            Some(Arc::clone(&registry)),
            audit.clone() as Arc<dyn AuditSink>,
        );
        let definition = definitions
            .save_and_publish(&definition(policy), "test")
            .await
            .unwrap();

        let executor = StepExecutor::new(
            Arc::clone(&store),
            registry,
            &EngineConfig::default(),
            Redactor::default(),
        );
        let manager = Arc::new(ExecutionManager::new(
            Arc::clone(&store),
            executor,
            audit.clone() as Arc<dyn AuditSink>,
        ));

        Self {
            store,
            manager,
            audit,
            calls,
            definition,
        }
    }

    fn poller(&self) -> RetryPoller<InMemoryStore> {
        RetryPoller::new(Arc::clone(&self.manager), &PollerConfig::default())
    }

    async fn create(&self, key: &str) -> stepwise_types::execution::Execution {
        self.manager
            .create_execution(
                "acme",
                &self.definition,
                NewExecution::new(Target::new("order", "ord_1"), serde_json::json!({}))
                    .with_idempotency_key(key),
            )
            .await
            .unwrap()
    }
}

fn definition(policy: RetryPolicy) -> Definition {
    Definition {
        tenant_id: "acme".into(),
        code: "charge-order".into(),
        version: 1,
        description: None,
        steps: vec![
            StepDef {
                step_id: "settle".into(),
                step_type: StepType::Delay,
                handler_name: None,
                params: StepParams::Delay { duration_ms: 1 },
                retry: None,
                timeout_ms: None,
                extra: BTreeMap::new(),
            },
            StepDef {
                step_id: "charge".into(),
                step_type: StepType::Custom,
                handler_name: Some("billing.charge".into()),
                params: StepParams::Custom {
                    payload: serde_json::json!({ "amount": 100 }),
                },
                retry: None,
                timeout_ms: None,
                extra: BTreeMap::new(),
            },
        ],
        policy,
        status: DefinitionStatus::Draft,
        published_at: None,
        created_at: Utc::now(),
        metadata: BTreeMap::new(),
    }
}

fn quick_policy(max_attempts: u32, backoff_strategy: BackoffStrategy) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_strategy,
        initial_delay_ms: 1,
        max_delay_ms: 4,
        ..RetryPolicy::default()
    }
}

fn transient() -> HandlerError {
    HandlerError::Timeout(Duration::from_millis(1))
}

// ---------------------------------------------------------------------------
// Scenario A: exhausted retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_transient_failures_exhaust_retries_into_dlq() {
    let h = Harness::new(transient(), quick_policy(3, BackoffStrategy::Exponential)).await;
    let exec = h.create("order-1").await;

    let after_first = h.manager.run_execution("acme", exec.id).await.unwrap();
    assert_eq!(after_first.status, ExecutionStatus::Waiting);

    let poller = h.poller();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        poller.poll_once(Utc::now()).await.unwrap();
        let current = h.manager.get_execution("acme", exec.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            break;
        }
    }

    let final_exec = h.manager.get_execution("acme", exec.id).await.unwrap().unwrap();
    assert_eq!(final_exec.status, ExecutionStatus::Failed);

    let charge_attempts: Vec<_> = h
        .manager
        .list_step_executions("acme", exec.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.step_id == "charge")
        .collect();
    let numbers: Vec<u32> = charge_attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(charge_attempts[0].status, StepStatus::Retrying);
    assert_eq!(charge_attempts[1].status, StepStatus::Retrying);
    assert_eq!(charge_attempts[2].status, StepStatus::Failed);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);

    let dlq = h.manager.list_dlq_entries("acme", 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].reason, DlqReason::MaxRetriesExceeded);
    assert_eq!(dlq[0].step_execution_id, charge_attempts[2].id);
    assert_eq!(dlq[0].error_class, ErrorClass::Transient);
}

// ---------------------------------------------------------------------------
// Scenario B: non-retryable failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_non_retryable_failure_dead_letters_first_attempt() {
    let h = Harness::new(
        HandlerError::Validation("card number 4111111111111111 rejected".into()),
        quick_policy(3, BackoffStrategy::Fixed),
    )
    .await;
    let exec = h.create("order-2").await;

    let result = h.manager.run_execution("acme", exec.id).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.finished_at.is_some());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = h.poller().poll_once(Utc::now()).await.unwrap();
    assert_eq!(report.due, 0);

    let attempts = h.manager.list_step_executions("acme", exec.id).await.unwrap();
    let charge: Vec<_> = attempts.iter().filter(|a| a.step_id == "charge").collect();
    assert_eq!(charge.len(), 1);
    assert_eq!(charge[0].error_class, Some(ErrorClass::NonRetryable));
    assert_eq!(
        charge[0].error_summary.as_deref(),
        Some("validation failed: card number [CARD] rejected")
    );

    let dlq = h.manager.list_dlq_entries("acme", 10).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].reason, DlqReason::NonRetryableError);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Scenario C: cancelled while retrying
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancelled_execution_gets_no_further_attempts() {
    let h = Harness::new(transient(), quick_policy(5, BackoffStrategy::Fixed)).await;
    let exec = h.create("order-3").await;

    let waiting = h.manager.run_execution("acme", exec.id).await.unwrap();
    assert_eq!(waiting.status, ExecutionStatus::Waiting);

    let cancelled = h.manager.cancel_execution("acme", exec.id, Some("ops")).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let report = h.poller().poll_once(Utc::now()).await.unwrap();
    assert_eq!(report.due, 0);

    // A direct resubmission is also refused a new attempt.
    let step = h.definition.step("charge").unwrap();
    let latest = h
        .manager
        .executor()
        .execute_step("acme", &cancelled, &h.definition, step)
        .await
        .unwrap();
    assert_eq!(latest.attempt_number, 1);
    assert_eq!(latest.status, StepStatus::Retrying);

    let rerun = h.manager.run_execution("acme", exec.id).await.unwrap();
    assert_eq!(rerun.status, ExecutionStatus::Cancelled);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    // Cancelling again is a no-op.
    let again = h.manager.cancel_execution("acme", exec.id, None).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// Idempotency and concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_converges_on_one_execution() {
    let h = Harness::new(transient(), quick_policy(3, BackoffStrategy::Fixed)).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&h.manager);
        let definition = h.definition.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .create_execution(
                    "acme",
                    &definition,
                    NewExecution::new(Target::new("order", "ord_9"), serde_json::json!({})),
                )
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let all = h.manager.list_executions("acme", None, 100).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].idempotency_key.starts_with("auto:"));
    assert_eq!(h.audit.count(EXECUTION_CREATED), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_keep_attempts_gap_free() {
    let policy = RetryPolicy {
        max_attempts: 5,
        backoff_strategy: BackoffStrategy::Fixed,
        initial_delay_ms: 0,
        max_delay_ms: 0,
        ..RetryPolicy::default()
    };
    let h = Harness::new(transient(), policy).await;
    let exec = h.create("order-4").await;
    h.store
        .update_execution_status("acme", &exec.id, ExecutionStatus::Running, Utc::now())
        .await
        .unwrap();
    let exec = h.manager.get_execution("acme", exec.id).await.unwrap().unwrap();

    for _ in 0..50 {
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&h.manager);
            let definition = h.definition.clone();
            let exec = exec.clone();
            tasks.push(tokio::spawn(async move {
                let step = definition.step("charge").unwrap().clone();
                manager
                    .executor()
                    .execute_step("acme", &exec, &definition, &step)
                    .await
                    .unwrap()
            }));
        }
        let mut done = false;
        for task in tasks {
            if task.await.unwrap().status == StepStatus::Failed {
                done = true;
            }
        }
        if done {
            break;
        }
    }

    let numbers: Vec<u32> = h
        .store
        .list_step_attempts(&exec.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.step_id == "charge")
        .map(|a| a.attempt_number)
        .collect();
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.calls.load(Ordering::SeqCst), 5);
    assert_eq!(h.manager.list_dlq_entries("acme", 10).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unpublished_definition_rejected() {
    let h = Harness::new(transient(), quick_policy(3, BackoffStrategy::Fixed)).await;
    let mut draft = h.definition.clone();
    draft.status = DefinitionStatus::Draft;
    let err = h
        .manager
        .create_execution(
            "acme",
            &draft,
            NewExecution::new(Target::new("order", "ord_1"), serde_json::json!({})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DefinitionNotPublished { .. }));
}

#[tokio::test]
async fn test_cross_tenant_reads_are_not_found() {
    let h = Harness::new(transient(), quick_policy(3, BackoffStrategy::Fixed)).await;
    let exec = h.create("order-5").await;
    assert!(h.manager.get_execution("globex", exec.id).await.unwrap().is_none());
    let err = h.manager.run_execution("globex", exec.id).await.unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotFound(_)));
    let err = h
        .manager
        .create_execution(
            "globex",
            &h.definition,
            NewExecution::new(Target::new("order", "ord_1"), serde_json::json!({})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TenantMismatch { .. }));
}
