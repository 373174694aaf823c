//! Dead-letter queue repository trait.

use stepwise_types::dlq::DlqEntry;
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

/// Append-only storage for terminal step failures.
pub trait DlqRepository: Send + Sync {
    /// Insert unless an entry for the same `step_execution_id` exists.
    /// Returns `true` if this call created the entry.
    fn insert_dlq_entry(
        &self,
        entry: &DlqEntry,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_dlq_entry_for_attempt(
        &self,
        step_execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<DlqEntry>, RepositoryError>> + Send;

    /// Newest first.
    fn list_dlq_entries(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<DlqEntry>, RepositoryError>> + Send;
}
