//! SQLite dead-letter queue repository.

use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use stepwise_core::repository::DlqRepository;
use stepwise_types::dlq::{DlqEntry, DlqReason};
use stepwise_types::error::RepositoryError;
use stepwise_types::retry::ErrorClass;
use uuid::Uuid;

use super::{SqliteStore, format_datetime, parse_datetime, parse_uuid, query_err, to_u32};

const DLQ_COLUMNS: &str = "id, tenant_id, execution_id, step_execution_id, step_id, \
     attempt_number, reason, error_class, error_summary, created_at";

struct DlqRow {
    id: String,
    tenant_id: String,
    execution_id: String,
    step_execution_id: String,
    step_id: String,
    attempt_number: i64,
    reason: String,
    error_class: String,
    error_summary: Option<String>,
    created_at: String,
}

impl DlqRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            execution_id: row.try_get("execution_id")?,
            step_execution_id: row.try_get("step_execution_id")?,
            step_id: row.try_get("step_id")?,
            attempt_number: row.try_get("attempt_number")?,
            reason: row.try_get("reason")?,
            error_class: row.try_get("error_class")?,
            error_summary: row.try_get("error_summary")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<DlqEntry, RepositoryError> {
        Ok(DlqEntry {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            execution_id: parse_uuid(&self.execution_id)?,
            step_execution_id: parse_uuid(&self.step_execution_id)?,
            step_id: self.step_id,
            attempt_number: to_u32(self.attempt_number, "attempt_number")?,
            reason: self
                .reason
                .parse::<DlqReason>()
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            error_class: self
                .error_class
                .parse::<ErrorClass>()
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            error_summary: self.error_summary,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

impl DlqRepository for SqliteStore {
    async fn insert_dlq_entry(&self, entry: &DlqEntry) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO dlq_entries
               (id, tenant_id, execution_id, step_execution_id, step_id, attempt_number,
                reason, error_class, error_summary, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(step_execution_id) DO NOTHING"#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.tenant_id)
        .bind(entry.execution_id.to_string())
        .bind(entry.step_execution_id.to_string())
        .bind(&entry.step_id)
        .bind(i64::from(entry.attempt_number))
        .bind(entry.reason.as_str())
        .bind(entry.error_class.as_str())
        .bind(&entry.error_summary)
        .bind(format_datetime(&entry.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_dlq_entry_for_attempt(
        &self,
        step_execution_id: &Uuid,
    ) -> Result<Option<DlqEntry>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DLQ_COLUMNS} FROM dlq_entries WHERE step_execution_id = ?"
        ))
        .bind(step_execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DlqRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_entry()?))
            }
            None => Ok(None),
        }
    }

    async fn list_dlq_entries(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DLQ_COLUMNS} FROM dlq_entries WHERE tenant_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(tenant_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DlqRow::from_row(row).map_err(query_err)?;
            entries.push(r.into_entry()?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::temp_store;
    use chrono::{DateTime, Utc};
    use stepwise_core::repository::ExecutionRepository;
    use stepwise_types::execution::{Execution, ExecutionStatus, StepExecution};

    async fn seed(store: &SqliteStore, now: DateTime<Utc>) -> (Execution, StepExecution) {
        let exec = Execution {
            id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            definition_code: "refund".to_string(),
            definition_version: 1,
            status: ExecutionStatus::Running,
            target_type: "order".to_string(),
            target_id: "o-1".to_string(),
            input_data: serde_json::json!({}),
            idempotency_key: "refund-o-1".to_string(),
            correlation_id: "corr".to_string(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        store.insert_execution(&exec).await.unwrap();
        let attempt = StepExecution::new_attempt(&exec, "refund", 1, now);
        store.insert_step_attempt(&attempt).await.unwrap();
        (exec, attempt)
    }

    fn entry_for(attempt: &StepExecution, now: DateTime<Utc>) -> DlqEntry {
        DlqEntry {
            id: Uuid::now_v7(),
            tenant_id: attempt.tenant_id.clone(),
            execution_id: attempt.execution_id,
            step_execution_id: attempt.id,
            step_id: attempt.step_id.clone(),
            attempt_number: attempt.attempt_number,
            reason: DlqReason::NonRetryableError,
            error_class: ErrorClass::NonRetryable,
            error_summary: Some("invalid card [CARD]".to_string()),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_one_dlq_entry_per_attempt() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let (_exec, attempt) = seed(&store, now).await;

        let first = entry_for(&attempt, now);
        assert!(store.insert_dlq_entry(&first).await.unwrap());
        assert!(!store.insert_dlq_entry(&entry_for(&attempt, now)).await.unwrap());

        let stored = store
            .get_dlq_entry_for_attempt(&attempt.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.reason, DlqReason::NonRetryableError);
        assert_eq!(stored.error_class, ErrorClass::NonRetryable);

        assert_eq!(store.list_dlq_entries("acme", 10).await.unwrap().len(), 1);
        assert!(store.list_dlq_entries("globex", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dlq_entry_outlives_deleted_execution() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();
        let (exec, attempt) = seed(&store, now).await;
        let entry = entry_for(&attempt, now);
        assert!(store.insert_dlq_entry(&entry).await.unwrap());

        let deleted = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(exec.id.to_string())
            .execute(&store.pool().writer)
            .await
            .unwrap();
        assert_eq!(deleted.rows_affected(), 1);
        assert!(store.list_step_attempts(&exec.id).await.unwrap().is_empty());

        let kept = store
            .get_dlq_entry_for_attempt(&attempt.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.id, entry.id);
        assert_eq!(kept.execution_id, exec.id);
        assert_eq!(store.list_dlq_entries("acme", 10).await.unwrap().len(), 1);
    }
}
