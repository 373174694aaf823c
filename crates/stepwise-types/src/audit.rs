//! Audit events handed to the external audit sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type emitted when a new execution row is created.
pub const EXECUTION_CREATED: &str = "execution.created";

/// Event type emitted when an execution is cancelled.
pub const EXECUTION_CANCELLED: &str = "execution.cancelled";

/// Event type emitted when a definition version is published.
pub const DEFINITION_PUBLISHED: &str = "definition.published";

/// A best-effort audit record. Delivery is not transactional with the
/// operation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub actor: String,
    pub resource_type: String,
    pub resource_id: String,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        actor: &str,
        resource_type: &str,
        resource_id: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.into(),
            metadata,
            occurred_at: Utc::now(),
        }
    }
}
