//! Application state wiring all services together.
//!
//! The engine services are generic over the store; AppState pins them to the
//! SQLite implementation.

use std::path::Path;
use std::sync::Arc;

use stepwise_core::audit::{AuditSink, TracingAuditSink};
use stepwise_core::engine::definition::DefinitionService;
use stepwise_core::engine::handler::{DelayHandler, HandlerRegistry, LoggingHandler};
use stepwise_core::engine::manager::ExecutionManager;
use stepwise_core::engine::redact::Redactor;
use stepwise_core::engine::step_executor::StepExecutor;
use stepwise_infra::config::{database_url, load_config, resolve_data_dir};
use stepwise_infra::sqlite::SqliteStore;
use stepwise_types::config::StepwiseConfig;
use stepwise_types::definition::StepType;

pub type ConcreteDefinitionService = DefinitionService<SqliteStore>;
pub type ConcreteExecutionManager = ExecutionManager<SqliteStore>;

/// Shared application state holding all services.
#[derive(Clone)]
pub struct AppState {
    pub definitions: Arc<ConcreteDefinitionService>,
    pub manager: Arc<ConcreteExecutionManager>,
    pub config: StepwiseConfig,
}

impl AppState {
    /// Resolve the data directory, load config, open the database and wire services.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;
        Self::init_in(&data_dir).await
    }

    pub async fn init_in(data_dir: &Path) -> anyhow::Result<Self> {
        let config = load_config(data_dir).await;
        let url = database_url(&config, data_dir);
        let store = Arc::new(SqliteStore::connect(&url).await?);

        let registry = Arc::new(default_registry());
        let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

        let definitions = Arc::new(DefinitionService::new(
            Arc::clone(&store),
            Some(Arc::clone(&registry)),
            Arc::clone(&audit),
        ));

        let executor = StepExecutor::new(
            Arc::clone(&store),
            registry,
            &config.engine,
            Redactor::new(config.redaction.max_length),
        );
        let manager = Arc::new(ExecutionManager::new(store, executor, audit));

        tracing::debug!(data_dir = %data_dir.display(), "application state ready");

        Ok(Self {
            definitions,
            manager,
            config,
        })
    }
}

/// Handlers available to the CLI: `delay` sleeps, delivery steps are logged.
pub fn default_registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_builtin(StepType::Delay, DelayHandler)
        .with_builtin(StepType::Email, LoggingHandler)
        .with_builtin(StepType::Notification, LoggingHandler)
        .with_builtin(StepType::Webhook, LoggingHandler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::engine::handler::HandlerKey;

    #[test]
    fn test_default_registry_covers_builtin_types() {
        let registry = default_registry();
        for step_type in [
            StepType::Email,
            StepType::Notification,
            StepType::Webhook,
            StepType::Delay,
        ] {
            assert!(registry.contains(&HandlerKey::Builtin(step_type)));
        }
        assert!(!registry.contains(&HandlerKey::Custom("crm.sync".into())));
    }

    #[tokio::test]
    async fn test_init_in_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init_in(dir.path()).await.unwrap();
        assert!(dir.path().join("stepwise.db").exists());
        assert!(state.definitions.list("acme").await.unwrap().is_empty());
        assert_eq!(state.config.engine.max_concurrent_handlers, 16);
    }
}
