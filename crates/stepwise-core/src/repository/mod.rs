//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology. Every uniqueness guarantee the engine relies
//! on (execution key per tenant, attempt number per step, one DLQ entry per
//! attempt) is enforced by the store, not by in-process locking.

pub mod definition;
pub mod dlq;
pub mod execution;
pub mod memory;

pub use definition::DefinitionRepository;
pub use dlq::DlqRepository;
pub use execution::{ExecutionRepository, StepOutcome};
pub use memory::InMemoryStore;

/// Everything the engine needs from storage.
pub trait Store: DefinitionRepository + ExecutionRepository + DlqRepository + 'static {}

impl<T> Store for T where T: DefinitionRepository + ExecutionRepository + DlqRepository + 'static {}
