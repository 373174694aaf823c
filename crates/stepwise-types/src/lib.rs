//! Shared domain types for Stepwise.
//!
//! Definitions, executions, step attempts, dead-letter entries, the error
//! class taxonomy and configuration structs. No infrastructure dependencies:
//! only serde, uuid, chrono, thiserror.

pub mod audit;
pub mod config;
pub mod definition;
pub mod dlq;
pub mod error;
pub mod execution;
pub mod retry;
