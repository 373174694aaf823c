//! SQLite definition repository.
//!
//! The full definition is stored as JSON; `status`, `published_at` and
//! `created_at` live in their own columns and win over the JSON copy.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use stepwise_core::repository::DefinitionRepository;
use stepwise_types::definition::{Definition, DefinitionStatus};
use stepwise_types::error::RepositoryError;

use super::{SqliteStore, format_datetime, parse_datetime, parse_optional_datetime, query_err};

const SELECT_DEFINITION: &str =
    "SELECT status, definition, published_at, created_at FROM definitions";

struct DefinitionRow {
    status: String,
    definition: String,
    published_at: Option<String>,
    created_at: String,
}

impl DefinitionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            status: row.try_get("status")?,
            definition: row.try_get("definition")?,
            published_at: row.try_get("published_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_definition(self) -> Result<Definition, RepositoryError> {
        let mut def: Definition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("deserialize definition: {e}")))?;
        def.status = self
            .status
            .parse::<DefinitionStatus>()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        def.published_at = parse_optional_datetime(self.published_at)?;
        def.created_at = parse_datetime(&self.created_at)?;
        Ok(def)
    }
}

fn definition_json(def: &Definition) -> Result<String, RepositoryError> {
    serde_json::to_string(def)
        .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))
}

impl DefinitionRepository for SqliteStore {
    async fn insert_definition(&self, def: &Definition) -> Result<bool, RepositoryError> {
        let json = definition_json(def)?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"INSERT INTO definitions
               (tenant_id, code, version, status, description, definition, published_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(tenant_id, code, version) DO NOTHING"#,
        )
        .bind(&def.tenant_id)
        .bind(&def.code)
        .bind(i64::from(def.version))
        .bind(def.status.as_str())
        .bind(&def.description)
        .bind(&json)
        .bind(def.published_at.as_ref().map(format_datetime))
        .bind(format_datetime(&def.created_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_draft_definition(&self, def: &Definition) -> Result<bool, RepositoryError> {
        let json = definition_json(def)?;

        let result = sqlx::query(
            r#"UPDATE definitions
               SET description = ?, definition = ?, updated_at = ?
               WHERE tenant_id = ? AND code = ? AND version = ? AND status = 'draft'"#,
        )
        .bind(&def.description)
        .bind(&json)
        .bind(format_datetime(&Utc::now()))
        .bind(&def.tenant_id)
        .bind(&def.code)
        .bind(i64::from(def.version))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_definition(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
    ) -> Result<Option<Definition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_DEFINITION} WHERE tenant_id = ? AND code = ? AND version = ?"
        ))
        .bind(tenant_id)
        .bind(code)
        .bind(i64::from(version))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self, tenant_id: &str) -> Result<Vec<Definition>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_DEFINITION} WHERE tenant_id = ? ORDER BY code ASC, version ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = DefinitionRow::from_row(row).map_err(query_err)?;
            defs.push(r.into_definition()?);
        }
        Ok(defs)
    }

    async fn transition_definition_status(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
        from: DefinitionStatus,
        to: DefinitionStatus,
        published_at: Option<DateTime<Utc>>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE definitions
               SET status = ?, published_at = COALESCE(?, published_at), updated_at = ?
               WHERE tenant_id = ? AND code = ? AND version = ? AND status = ?"#,
        )
        .bind(to.as_str())
        .bind(published_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(tenant_id)
        .bind(code)
        .bind(i64::from(version))
        .bind(from.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }
}
