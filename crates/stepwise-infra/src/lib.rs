//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the repository traits defined in `stepwise-core`:
//! SQLite storage with split reader/writer pools, plus data directory and
//! `config.toml` resolution.

pub mod config;
pub mod sqlite;
