//! Execution engine logic and repository trait definitions for Stepwise.
//!
//! This crate defines the storage "ports" (repository traits) that the
//! infrastructure layer implements, plus the engine itself: redaction, error
//! classification, retry policy, the handler registry, the step executor, the
//! execution manager, DLQ routing and the retry poller. It depends only on
//! `stepwise-types`, never on `stepwise-infra` or any database crate.

pub mod audit;
pub mod engine;
pub mod repository;
