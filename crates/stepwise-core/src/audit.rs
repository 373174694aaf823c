//! Audit sink port.
//!
//! Audit delivery is best-effort and never transactional with the operation
//! that produced the event: `emit` cannot fail from the caller's point of
//! view. Storage of audit logs lives outside this crate.

use stepwise_types::audit::AuditEvent;

/// Receives audit events emitted by the engine.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Writes audit events to the `stepwise::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            target: "stepwise::audit",
            event_type = event.event_type.as_str(),
            actor = event.actor.as_str(),
            resource_type = event.resource_type.as_str(),
            resource_id = event.resource_id.as_str(),
            metadata = %event.metadata,
            "audit event"
        );
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}
