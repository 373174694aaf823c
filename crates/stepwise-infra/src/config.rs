//! Data directory and configuration loading for Stepwise.
//!
//! Reads `config.toml` from the data directory (`~/.stepwise/` by default)
//! and deserializes it into [`StepwiseConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use stepwise_types::config::StepwiseConfig;

use crate::sqlite::pool::default_database_url;

/// Resolve the data directory.
///
/// Priority:
/// 1. `STEPWISE_DATA_DIR` environment variable
/// 2. `~/.stepwise`
/// 3. `.stepwise` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWISE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }

    PathBuf::from(".stepwise")
}

/// Load configuration from `{data_dir}/config.toml`.
pub async fn load_config(data_dir: &Path) -> StepwiseConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return StepwiseConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return StepwiseConfig::default();
        }
    };

    match toml::from_str::<StepwiseConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            StepwiseConfig::default()
        }
    }
}

/// The configured `database_url`, or the default file under `data_dir`.
pub fn database_url(config: &StepwiseConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| default_database_url(data_dir))
}
