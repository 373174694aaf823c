//! SQLite execution and step-attempt repository.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use stepwise_core::repository::{ExecutionRepository, StepOutcome};
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{Execution, ExecutionStatus, StepExecution, StepStatus};
use stepwise_types::retry::ErrorClass;
use uuid::Uuid;

use super::{
    SqliteStore, format_datetime, parse_datetime, parse_json, parse_optional_datetime,
    parse_uuid, query_err, to_u32,
};

const EXECUTION_COLUMNS: &str = "id, tenant_id, definition_code, definition_version, status, \
     target_type, target_id, input_data, idempotency_key, correlation_id, \
     created_at, updated_at, finished_at";

const STEP_COLUMNS: &str = "s.id, s.tenant_id, s.execution_id, s.step_id, s.attempt_number, \
     s.status, s.idempotency_key, s.error_class, s.error_summary, s.result_data, \
     s.created_at, s.started_at, s.finished_at, s.retry_after_at";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    tenant_id: String,
    definition_code: String,
    definition_version: i64,
    status: String,
    target_type: String,
    target_id: String,
    input_data: String,
    idempotency_key: String,
    correlation_id: String,
    created_at: String,
    updated_at: String,
    finished_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            definition_code: row.try_get("definition_code")?,
            definition_version: row.try_get("definition_version")?,
            status: row.try_get("status")?,
            target_type: row.try_get("target_type")?,
            target_id: row.try_get("target_id")?,
            input_data: row.try_get("input_data")?,
            idempotency_key: row.try_get("idempotency_key")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            definition_code: self.definition_code,
            definition_version: to_u32(self.definition_version, "definition_version")?,
            status: self
                .status
                .parse::<ExecutionStatus>()
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            target_type: self.target_type,
            target_id: self.target_id,
            input_data: parse_json(&self.input_data, "input_data")?,
            idempotency_key: self.idempotency_key,
            correlation_id: self.correlation_id,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            finished_at: parse_optional_datetime(self.finished_at)?,
        })
    }
}

struct StepExecutionRow {
    id: String,
    tenant_id: String,
    execution_id: String,
    step_id: String,
    attempt_number: i64,
    status: String,
    idempotency_key: String,
    error_class: Option<String>,
    error_summary: Option<String>,
    result_data: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    retry_after_at: Option<String>,
}

impl StepExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            attempt_number: row.try_get("attempt_number")?,
            status: row.try_get("status")?,
            idempotency_key: row.try_get("idempotency_key")?,
            error_class: row.try_get("error_class")?,
            error_summary: row.try_get("error_summary")?,
            result_data: row.try_get("result_data")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            retry_after_at: row.try_get("retry_after_at")?,
        })
    }

    fn into_step_execution(self) -> Result<StepExecution, RepositoryError> {
        let error_class = self
            .error_class
            .as_deref()
            .map(str::parse::<ErrorClass>)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let result_data = self
            .result_data
            .as_deref()
            .map(|s| parse_json(s, "result_data"))
            .transpose()?;

        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            attempt_number: to_u32(self.attempt_number, "attempt_number")?,
            status: self
                .status
                .parse::<StepStatus>()
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            idempotency_key: self.idempotency_key,
            error_class,
            error_summary: self.error_summary,
            result_data,
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_optional_datetime(self.started_at)?,
            finished_at: parse_optional_datetime(self.finished_at)?,
            retry_after_at: parse_optional_datetime(self.retry_after_at)?,
        })
    }
}

fn executions_from_rows(rows: &[SqliteRow]) -> Result<Vec<Execution>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ExecutionRow::from_row(row).map_err(query_err)?;
        out.push(r.into_execution()?);
    }
    Ok(out)
}

fn attempts_from_rows(rows: &[SqliteRow]) -> Result<Vec<StepExecution>, RepositoryError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let r = StepExecutionRow::from_row(row).map_err(query_err)?;
        out.push(r.into_step_execution()?);
    }
    Ok(out)
}

/// Column values written by `record_step_outcome`.
struct OutcomeColumns {
    status: StepStatus,
    error_class: Option<&'static str>,
    error_summary: Option<String>,
    result_data: Option<String>,
    retry_after_at: Option<String>,
    finished_at: String,
}

impl OutcomeColumns {
    fn from_outcome(outcome: &StepOutcome) -> Result<Self, RepositoryError> {
        Ok(match outcome {
            StepOutcome::Succeeded {
                result_data,
                finished_at,
            } => Self {
                status: StepStatus::Succeeded,
                error_class: None,
                error_summary: None,
                result_data: Some(
                    serde_json::to_string(result_data)
                        .map_err(|e| RepositoryError::Query(e.to_string()))?,
                ),
                retry_after_at: None,
                finished_at: format_datetime(finished_at),
            },
            StepOutcome::Retrying {
                error_class,
                error_summary,
                retry_after_at,
                finished_at,
            } => Self {
                status: StepStatus::Retrying,
                error_class: Some(error_class.as_str()),
                error_summary: Some(error_summary.clone()),
                result_data: None,
                retry_after_at: Some(format_datetime(retry_after_at)),
                finished_at: format_datetime(finished_at),
            },
            StepOutcome::Failed {
                error_class,
                error_summary,
                finished_at,
            } => Self {
                status: StepStatus::Failed,
                error_class: Some(error_class.as_str()),
                error_summary: Some(error_summary.clone()),
                result_data: None,
                retry_after_at: None,
                finished_at: format_datetime(finished_at),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteStore {
    async fn insert_execution(&self, execution: &Execution) -> Result<bool, RepositoryError> {
        let input = serde_json::to_string(&execution.input_data)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, tenant_id, definition_code, definition_version, status, target_type,
                target_id, input_data, idempotency_key, correlation_id, created_at,
                updated_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(tenant_id, idempotency_key) DO NOTHING"#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.tenant_id)
        .bind(&execution.definition_code)
        .bind(i64::from(execution.definition_version))
        .bind(execution.status.as_str())
        .bind(&execution.target_type)
        .bind(&execution.target_id)
        .bind(&input)
        .bind(&execution.idempotency_key)
        .bind(&execution.correlation_id)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.finished_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_execution(
        &self,
        tenant_id: &str,
        execution_id: &Uuid,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE tenant_id = ? AND id = ?"
        ))
        .bind(tenant_id)
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn get_execution_by_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE tenant_id = ? AND idempotency_key = ?"
        ))
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        tenant_id: &str,
        status: Option<ExecutionStatus>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE tenant_id = ? AND status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(tenant_id)
                .bind(s.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE tenant_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(tenant_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        executions_from_rows(&rows)
    }

    async fn update_execution_status(
        &self,
        tenant_id: &str,
        execution_id: &Uuid,
        status: ExecutionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now_str = format_datetime(&now);
        let finished_at = status.is_terminal().then(|| now_str.clone());

        let result = sqlx::query(
            r#"UPDATE executions
               SET status = ?, updated_at = ?, finished_at = COALESCE(?, finished_at)
               WHERE tenant_id = ? AND id = ?
                 AND status NOT IN ('completed', 'failed', 'cancelled')"#,
        )
        .bind(status.as_str())
        .bind(&now_str)
        .bind(&finished_at)
        .bind(tenant_id)
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_step_attempt(&self, attempt: &StepExecution) -> Result<bool, RepositoryError> {
        let result_data = attempt
            .result_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO step_executions
               (id, tenant_id, execution_id, step_id, attempt_number, status, idempotency_key,
                error_class, error_summary, result_data, created_at, started_at, finished_at,
                retry_after_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id, step_id, attempt_number) DO NOTHING"#,
        )
        .bind(attempt.id.to_string())
        .bind(&attempt.tenant_id)
        .bind(attempt.execution_id.to_string())
        .bind(&attempt.step_id)
        .bind(i64::from(attempt.attempt_number))
        .bind(attempt.status.as_str())
        .bind(&attempt.idempotency_key)
        .bind(attempt.error_class.map(|c| c.as_str()))
        .bind(&attempt.error_summary)
        .bind(&result_data)
        .bind(format_datetime(&attempt.created_at))
        .bind(attempt.started_at.as_ref().map(format_datetime))
        .bind(attempt.finished_at.as_ref().map(format_datetime))
        .bind(attempt.retry_after_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_step_attempt(
        &self,
        attempt_id: &Uuid,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions s WHERE s.id = ?"
        ))
        .bind(attempt_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = StepExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_step_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn latest_step_attempt(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions s \
             WHERE s.execution_id = ? AND s.step_id = ? \
             ORDER BY s.attempt_number DESC LIMIT 1"
        ))
        .bind(execution_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = StepExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_step_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_step_attempts(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM step_executions s WHERE s.execution_id = ? \
             ORDER BY s.created_at ASC, s.attempt_number ASC, s.id ASC"
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        attempts_from_rows(&rows)
    }

    async fn claim_step_attempt(
        &self,
        attempt_id: &Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE step_executions SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(format_datetime(&started_at))
        .bind(attempt_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_step_outcome(
        &self,
        attempt_id: &Uuid,
        outcome: &StepOutcome,
    ) -> Result<bool, RepositoryError> {
        let cols = OutcomeColumns::from_outcome(outcome)?;

        let result = sqlx::query(
            r#"UPDATE step_executions
               SET status = ?, error_class = ?, error_summary = ?, result_data = ?,
                   retry_after_at = ?, finished_at = ?
               WHERE id = ? AND status = 'running'"#,
        )
        .bind(cols.status.as_str())
        .bind(cols.error_class)
        .bind(&cols.error_summary)
        .bind(&cols.result_data)
        .bind(&cols.retry_after_at)
        .bind(&cols.finished_at)
        .bind(attempt_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        // Only the newest attempt of a step counts, and only while its
        // execution can still make progress.
        let rows = sqlx::query(&format!(
            r#"SELECT {STEP_COLUMNS}
               FROM step_executions s
               JOIN executions e ON e.id = s.execution_id
               WHERE s.status = 'retrying'
                 AND (s.retry_after_at IS NULL OR s.retry_after_at <= ?)
                 AND e.status NOT IN ('completed', 'failed', 'cancelled')
                 AND NOT EXISTS (
                     SELECT 1 FROM step_executions n
                     WHERE n.execution_id = s.execution_id
                       AND n.step_id = s.step_id
                       AND n.attempt_number > s.attempt_number
                 )
               ORDER BY s.retry_after_at ASC
               LIMIT ?"#
        ))
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        attempts_from_rows(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::temp_store;
    use chrono::Duration;

    fn execution(tenant: &str, key: &str) -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::now_v7(),
            tenant_id: tenant.to_string(),
            definition_code: "welcome".to_string(),
            definition_version: 1,
            status: ExecutionStatus::Pending,
            target_type: "user".to_string(),
            target_id: "u-1".to_string(),
            input_data: serde_json::json!({"plan": "pro"}),
            idempotency_key: key.to_string(),
            correlation_id: "corr-1".to_string(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_execution_key_is_unique_per_tenant() {
        let (_dir, store) = temp_store().await;
        let first = execution("acme", "signup-u-1");

        assert!(store.insert_execution(&first).await.unwrap());
        assert!(!store.insert_execution(&execution("acme", "signup-u-1")).await.unwrap());
        assert!(store.insert_execution(&execution("globex", "signup-u-1")).await.unwrap());

        let found = store
            .get_execution_by_key("acme", "signup-u-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.input_data["plan"], "pro");
        assert!(store.get_execution("globex", &first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let (_dir, store) = temp_store().await;
        let exec = execution("acme", "k");
        store.insert_execution(&exec).await.unwrap();

        let now = Utc::now();
        assert!(
            store
                .update_execution_status("acme", &exec.id, ExecutionStatus::Cancelled, now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_execution_status("acme", &exec.id, ExecutionStatus::Running, now)
                .await
                .unwrap()
        );

        let loaded = store.get_execution("acme", &exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Cancelled);
        assert!(loaded.finished_at.is_some());

        let cancelled = store
            .list_executions("acme", Some(ExecutionStatus::Cancelled), 10)
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(
            store
                .list_executions("acme", Some(ExecutionStatus::Running), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_attempt_number_is_unique_per_step() {
        let (_dir, store) = temp_store().await;
        let exec = execution("acme", "k");
        store.insert_execution(&exec).await.unwrap();

        let now = Utc::now();
        let first = StepExecution::new_attempt(&exec, "send", 1, now);
        assert!(store.insert_step_attempt(&first).await.unwrap());
        let dup = StepExecution::new_attempt(&exec, "send", 1, now);
        assert!(!store.insert_step_attempt(&dup).await.unwrap());
        assert!(store.get_step_attempt(&dup.id).await.unwrap().is_none());

        let second = StepExecution::new_attempt(&exec, "send", 2, now);
        assert!(store.insert_step_attempt(&second).await.unwrap());

        let latest = store
            .latest_step_attempt(&exec.id, "send")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.attempt_number, 2);
        assert_eq!(latest.idempotency_key, "k:send:2");
        assert_eq!(store.list_step_attempts(&exec.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_and_record_are_conditional() {
        let (_dir, store) = temp_store().await;
        let exec = execution("acme", "k");
        store.insert_execution(&exec).await.unwrap();
        let attempt = StepExecution::new_attempt(&exec, "send", 1, Utc::now());
        store.insert_step_attempt(&attempt).await.unwrap();

        let outcome = StepOutcome::Succeeded {
            result_data: serde_json::json!({"ok": true}),
            finished_at: Utc::now(),
        };
        // Cannot record before the attempt is claimed.
        assert!(!store.record_step_outcome(&attempt.id, &outcome).await.unwrap());

        assert!(store.claim_step_attempt(&attempt.id, Utc::now()).await.unwrap());
        assert!(!store.claim_step_attempt(&attempt.id, Utc::now()).await.unwrap());

        assert!(store.record_step_outcome(&attempt.id, &outcome).await.unwrap());
        assert!(!store.record_step_outcome(&attempt.id, &outcome).await.unwrap());

        let loaded = store.get_step_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, StepStatus::Succeeded);
        assert_eq!(loaded.result_data, Some(serde_json::json!({"ok": true})));
        assert!(loaded.started_at.is_some());
    }

    async fn retrying(
        store: &SqliteStore,
        exec: &Execution,
        n: u32,
        now: DateTime<Utc>,
    ) -> StepExecution {
        let attempt = StepExecution::new_attempt(exec, "send", n, now);
        store.insert_step_attempt(&attempt).await.unwrap();
        store.claim_step_attempt(&attempt.id, now).await.unwrap();
        store
            .record_step_outcome(
                &attempt.id,
                &StepOutcome::Retrying {
                    error_class: ErrorClass::Transient,
                    error_summary: "timeout".to_string(),
                    retry_after_at: now - Duration::seconds(1),
                    finished_at: now,
                },
            )
            .await
            .unwrap();
        attempt
    }

    #[tokio::test]
    async fn test_due_retries_skip_superseded_and_cancelled() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        let live = execution("acme", "live");
        let cancelled = execution("acme", "gone");
        store.insert_execution(&live).await.unwrap();
        store.insert_execution(&cancelled).await.unwrap();

        retrying(&store, &live, 1, now).await;
        let newest = retrying(&store, &live, 2, now).await;
        retrying(&store, &cancelled, 1, now).await;
        store
            .update_execution_status("acme", &cancelled.id, ExecutionStatus::Cancelled, now)
            .await
            .unwrap();

        let due = store.list_due_retries(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, newest.id);
        assert_eq!(due[0].error_class, Some(ErrorClass::Transient));

        // Not yet due one minute in the past.
        let early = store
            .list_due_retries(now - Duration::minutes(1), 10)
            .await
            .unwrap();
        assert!(early.is_empty());
    }
}
