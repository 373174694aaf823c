//! Configuration types for Stepwise.
//!
//! `StepwiseConfig` represents the top-level `config.toml` that controls the
//! handler worker pool, redaction bounds and the retry poller.

use serde::{Deserialize, Serialize};

/// Top-level configuration. All sections have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepwiseConfig {
    /// SQLite URL; defaults to `{data_dir}/stepwise.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub redaction: RedactionConfig,

    #[serde(default)]
    pub poller: PollerConfig,
}

/// Step executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the handler worker pool.
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,

    /// Handler timeout for steps that do not set `timeout_ms`.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,
}

fn default_max_concurrent_handlers() -> usize {
    16
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: default_max_concurrent_handlers(),
            default_step_timeout_ms: default_step_timeout_ms(),
        }
    }
}

/// Error text redaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Maximum length (in characters) of any persisted error summary.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_length() -> usize {
    500
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
        }
    }
}

/// Retry poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Maximum due retries picked up per pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_batch_size() -> u32 {
    100
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}
