//! Step handlers and the handler registry.
//!
//! Follows the same blanket-impl pattern as the LLM provider wrapper:
//! 1. `Handler` uses native async fn in traits (RPITIT)
//! 2. An object-safe `HandlerDyn` trait with boxed futures
//! 3. Blanket-impl `HandlerDyn` for all `T: Handler`
//!
//! The registry is keyed by step type for built-ins and by namespaced name
//! (e.g. `billing.refund`) for custom steps. It is populated at startup and
//! shared immutably behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use stepwise_types::definition::{Definition, StepDef, StepParams, StepType};
use stepwise_types::execution::Target;
use thiserror::Error;
use uuid::Uuid;

use super::error::EngineError;

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

/// Error returned by a handler. Never escapes the step executor: it is
/// classified, redacted and recorded on the attempt.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("dependency failed: {0}")]
    Dependency(String),

    #[error("compensation required: {0}")]
    CompensationRequired(String),

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(message: impl fmt::Display) -> Self {
        HandlerError::Other(message.to_string())
    }

    /// Server-provided minimum wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HandlerError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Everything a handler may know about the execution it runs in.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub definition_code: String,
    pub definition_version: u32,
    pub target: Target,
    pub input_data: serde_json::Value,
    pub correlation_id: String,
    pub step_id: String,
    pub attempt_number: u32,
}

/// Performs the side effect of a step.
///
/// Implementations must be idempotent for a fixed `idempotency_key`: the
/// engine may call a handler more than once with the same key after a crash.
pub trait Handler: Send + Sync {
    fn handle(
        &self,
        step: &StepDef,
        ctx: &ExecutionContext,
        idempotency_key: &str,
    ) -> impl Future<Output = Result<serde_json::Value, HandlerError>> + Send;
}

/// Object-safe version of [`Handler`] with boxed futures.
pub trait HandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepDef,
        ctx: &'a ExecutionContext,
        idempotency_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'a>>;
}

impl<T: Handler> HandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepDef,
        ctx: &'a ExecutionContext,
        idempotency_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'a>> {
        Box::pin(self.handle(step, ctx, idempotency_key))
    }
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn HandlerDyn>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Builtin(StepType),
    Custom(String),
}

impl HandlerKey {
    /// The key a step dispatches to. Custom steps without a `handler_name`
    /// cannot be dispatched.
    pub fn for_step(step: &StepDef) -> Option<HandlerKey> {
        match step.step_type {
            StepType::Custom => step
                .handler_name
                .as_ref()
                .map(|name| HandlerKey::Custom(name.clone())),
            other => Some(HandlerKey::Builtin(other)),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKey::Builtin(step_type) => write!(f, "{step_type}"),
            HandlerKey::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, BoxHandler>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a built-in step type. Registering `Custom`
    /// here is a no-op: custom steps resolve by name.
    pub fn register_builtin<H: Handler + 'static>(&mut self, step_type: StepType, handler: H) {
        if step_type == StepType::Custom {
            tracing::warn!("ignoring builtin registration for custom step type");
            return;
        }
        self.handlers
            .insert(HandlerKey::Builtin(step_type), Arc::new(handler));
    }

    /// Register a handler for custom steps naming `name`.
    pub fn register_custom<H: Handler + 'static>(&mut self, name: impl Into<String>, handler: H) {
        self.handlers
            .insert(HandlerKey::Custom(name.into()), Arc::new(handler));
    }

    pub fn with_builtin<H: Handler + 'static>(mut self, step_type: StepType, handler: H) -> Self {
        self.register_builtin(step_type, handler);
        self
    }

    pub fn with_custom<H: Handler + 'static>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.register_custom(name, handler);
        self
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Resolve the handler for a step or fail with `HandlerNotRegistered`.
    pub fn resolve(&self, step: &StepDef) -> Result<BoxHandler, EngineError> {
        let key = HandlerKey::for_step(step).ok_or_else(|| {
            EngineError::HandlerNotRegistered(format!(
                "custom step '{}' without handler_name",
                step.step_id
            ))
        })?;
        self.handlers
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::HandlerNotRegistered(key.to_string()))
    }

    /// Keys referenced by a definition that have no registered handler.
    pub fn missing_handlers(&self, definition: &Definition) -> Vec<String> {
        definition
            .steps
            .iter()
            .filter_map(|step| match HandlerKey::for_step(step) {
                Some(key) if self.contains(&key) => None,
                Some(key) => Some(key.to_string()),
                None => Some(format!("custom step '{}' without handler_name", step.step_id)),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Sleeps for `params.duration_ms`. Holds no lock or transaction while asleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayHandler;

impl Handler for DelayHandler {
    async fn handle(
        &self,
        step: &StepDef,
        _ctx: &ExecutionContext,
        _idempotency_key: &str,
    ) -> Result<serde_json::Value, HandlerError> {
        let StepParams::Delay { duration_ms } = &step.params else {
            return Err(HandlerError::Validation(format!(
                "step '{}' has {} params, expected delay",
                step.step_id,
                step.params.step_type()
            )));
        };
        tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
        Ok(serde_json::json!({ "slept_ms": duration_ms }))
    }
}

/// Records the step through `tracing` and succeeds. Stands in for delivery
/// channels (email, notification, webhook) that are wired up outside the
/// engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl Handler for LoggingHandler {
    async fn handle(
        &self,
        step: &StepDef,
        ctx: &ExecutionContext,
        idempotency_key: &str,
    ) -> Result<serde_json::Value, HandlerError> {
        tracing::info!(
            execution_id = %ctx.execution_id,
            step_id = %step.step_id,
            step_type = %step.step_type,
            idempotency_key,
            "step delivered to log"
        );
        Ok(serde_json::json!({
            "delivered": "log",
            "idempotency_key": idempotency_key,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn step(step_id: &str, params: StepParams, handler_name: Option<&str>) -> StepDef {
        StepDef {
            step_id: step_id.to_string(),
            step_type: params.step_type(),
            handler_name: handler_name.map(str::to_string),
            params,
            retry: None,
            timeout_ms: None,
            extra: BTreeMap::new(),
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            tenant_id: "acme".into(),
            execution_id: Uuid::now_v7(),
            definition_code: "welcome".into(),
            definition_version: 1,
            target: Target::new("user", "u-1"),
            input_data: serde_json::json!({}),
            correlation_id: "corr".into(),
            step_id: "s".into(),
            attempt_number: 1,
        }
    }

    #[test]
    fn test_resolve_builtin_and_custom() {
        let registry = HandlerRegistry::new()
            .with_builtin(StepType::Delay, DelayHandler)
            .with_custom("billing.refund", LoggingHandler);

        let delay = step("wait", StepParams::Delay { duration_ms: 1 }, None);
        assert!(registry.resolve(&delay).is_ok());

        let refund = step(
            "refund",
            StepParams::Custom {
                payload: serde_json::Value::Null,
            },
            Some("billing.refund"),
        );
        assert!(registry.resolve(&refund).is_ok());
    }

    #[test]
    fn test_resolve_missing_handler_fails() {
        let registry = HandlerRegistry::new();
        let webhook = step(
            "notify",
            StepParams::Webhook {
                url: "https://example.com".into(),
                method: "POST".into(),
                headers: BTreeMap::new(),
                body: None,
            },
            None,
        );
        let err = registry.resolve(&webhook).err().unwrap();
        assert!(matches!(err, EngineError::HandlerNotRegistered(ref key) if key == "webhook"));

        let unnamed = step(
            "x",
            StepParams::Custom {
                payload: serde_json::Value::Null,
            },
            None,
        );
        assert!(matches!(
            registry.resolve(&unnamed),
            Err(EngineError::HandlerNotRegistered(_))
        ));
    }

    #[test]
    fn test_custom_registration_is_by_name_not_type() {
        let registry = HandlerRegistry::new().with_builtin(StepType::Custom, LoggingHandler);
        assert!(!registry.contains(&HandlerKey::Builtin(StepType::Custom)));
        assert_eq!(
            HandlerKey::Custom("billing.refund".into()).to_string(),
            "custom:billing.refund"
        );
    }

    #[tokio::test]
    async fn test_delay_handler_sleeps_and_reports() {
        let delay = step("wait", StepParams::Delay { duration_ms: 5 }, None);
        let result = DelayHandler.handle(&delay, &ctx(), "k").await.unwrap();
        assert_eq!(result["slept_ms"], 5);
    }

    #[tokio::test]
    async fn test_delay_handler_rejects_wrong_params() {
        let wrong = StepDef {
            step_type: StepType::Delay,
            ..step(
                "wait",
                StepParams::Custom {
                    payload: serde_json::Value::Null,
                },
                None,
            )
        };
        let err = DelayHandler.handle(&wrong, &ctx(), "k").await.unwrap_err();
        assert!(matches!(err, HandlerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_boxed_dispatch_passes_idempotency_key() {
        let handler: BoxHandler = Arc::new(LoggingHandler);
        let s = step(
            "mail",
            StepParams::Notification {
                channel: "sms".into(),
                recipient: "u-1".into(),
                message: "hi".into(),
            },
            None,
        );
        let out = handler.handle_boxed(&s, &ctx(), "key-1:mail:1").await.unwrap();
        assert_eq!(out["idempotency_key"], "key-1:mail:1");
    }
}
