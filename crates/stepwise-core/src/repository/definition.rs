//! Definition repository trait.

use chrono::{DateTime, Utc};
use stepwise_types::definition::{Definition, DefinitionStatus};
use stepwise_types::error::RepositoryError;

/// Storage for versioned workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// Insert a new `(tenant_id, code, version)`. Returns `false` if that
    /// version already exists; the stored row is left untouched.
    fn insert_definition(
        &self,
        def: &Definition,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Replace the body of an existing version, but only while it is still
    /// `draft`. Returns `false` if it is missing or no longer a draft.
    fn replace_draft_definition(
        &self,
        def: &Definition,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_definition(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<Definition>, RepositoryError>> + Send;

    /// All versions for a tenant, ordered by code then version.
    fn list_definitions(
        &self,
        tenant_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Definition>, RepositoryError>> + Send;

    /// Move a version from `from` to `to`. Returns `false` if the stored
    /// status was not `from`. `published_at` is set only when provided.
    fn transition_definition_status(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
        from: DefinitionStatus,
        to: DefinitionStatus,
        published_at: Option<DateTime<Utc>>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
