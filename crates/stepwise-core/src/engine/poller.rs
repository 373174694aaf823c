//! Retry poller: resumes executions whose retries have become due.
//!
//! A `retrying` attempt with `retry_after_at <= now` is "due". Each pass lists
//! a bounded batch of due attempts (oldest deadline first) and re-runs the
//! owning execution's step loop. Resubmitting twice is harmless: the step
//! executor's get-or-create path makes duplicate submissions converge.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepwise_types::config::PollerConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::repository::Store;

use super::error::EngineError;
use super::manager::ExecutionManager;

/// Counters for one poller pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Due attempts returned by the store.
    pub due: usize,
    /// Executions whose step loop ran without error.
    pub resumed: usize,
    /// Executions whose step loop returned an error.
    pub errors: usize,
}

pub struct RetryPoller<S: Store> {
    manager: Arc<ExecutionManager<S>>,
    interval: Duration,
    batch_size: u32,
}

impl<S: Store> RetryPoller<S> {
    pub fn new(manager: Arc<ExecutionManager<S>>, config: &PollerConfig) -> Self {
        Self {
            manager,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Resume every execution with a retry due at `now`.
    ///
    /// Each distinct execution runs on its own task, so a slow handler in one
    /// does not hold up the others. Handler concurrency stays bounded by the
    /// step executor's worker pool.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport, EngineError> {
        let due = self
            .manager
            .store()
            .list_due_retries(now, self.batch_size)
            .await?;

        let mut report = PollReport {
            due: due.len(),
            ..PollReport::default()
        };
        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();

        for attempt in due {
            if !seen.insert(attempt.execution_id) {
                continue;
            }
            let manager = Arc::clone(&self.manager);
            tasks.spawn(async move {
                let result = manager
                    .run_execution(&attempt.tenant_id, attempt.execution_id)
                    .await;
                (attempt, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(execution))) => {
                    report.resumed += 1;
                    tracing::debug!(
                        execution_id = %execution.id,
                        status = %execution.status,
                        "resumed execution"
                    );
                }
                Ok((attempt, Err(e))) => {
                    report.errors += 1;
                    tracing::error!(
                        execution_id = %attempt.execution_id,
                        step_id = %attempt.step_id,
                        error = %e,
                        "failed to resume execution"
                    );
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "resume task aborted");
                }
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                resumed = report.resumed,
                errors = report.errors,
                "retry poller pass"
            );
        }
        Ok(report)
    }

    /// Poll on the configured interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "retry poller started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        tracing::error!(error = %e, "retry poller pass failed");
                    }
                }
            }
        }
        tracing::info!("retry poller stopped");
    }
}
