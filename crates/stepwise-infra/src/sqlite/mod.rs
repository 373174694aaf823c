//! SQLite storage layer.
//!
//! A single `SqliteStore` implements every repository port on top of a WAL
//! database with split read/write connection pools. Uniqueness is enforced by
//! the schema; racing writers resolve through `ON CONFLICT DO NOTHING` and
//! conditional updates rather than application locks.

pub mod definition;
pub mod dlq;
pub mod execution;
pub mod pool;

use chrono::{DateTime, SecondsFormat, Utc};
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

pub use pool::DatabasePool;

/// SQLite-backed implementation of the definition, execution and DLQ repositories.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = DatabasePool::new(database_url).await.map_err(|e| {
            tracing::error!(error = %e, "failed to open database");
            RepositoryError::Connection
        })?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Fixed-width UTC timestamps so that text comparison orders like time.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: &str, what: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_u32(value: i64, what: &str) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Query(format!("{what} out of range: {value}")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::SqliteStore;

    /// Store on a fresh temp-file database. Keep the `TempDir` alive for the test.
    pub async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("stepwise.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let store = SqliteStore::connect(&url).await.unwrap();
        (dir, store)
    }
}
