//! The execution engine.
//!
//! - `redact` / `classify` / `retry`: pure functions deciding what is stored
//!   about a failure and whether it is retried.
//! - `handler`: the handler trait, its object-safe wrapper and the registry.
//! - `step_executor`: runs one attempt of one step.
//! - `manager`: creates executions idempotently and drives their steps.
//! - `dlq`: routes terminal failures to the dead-letter queue.
//! - `definition`: definition parsing, validation and lifecycle.
//! - `poller`: resumes executions whose retries have become due.

pub mod classify;
pub mod definition;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod manager;
pub mod poller;
pub mod redact;
pub mod retry;
pub mod step_executor;

pub use error::EngineError;
