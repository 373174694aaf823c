//! Definition parsing, validation and lifecycle.
//!
//! Converts between YAML files and `Definition`, validates structural
//! constraints (codes, unique step IDs, typed params, retry bounds) and moves
//! versions through `draft -> published -> deprecated`. Published versions are
//! frozen: edits need a new version.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use stepwise_types::audit::{AuditEvent, DEFINITION_PUBLISHED};
use stepwise_types::definition::{Definition, DefinitionStatus, StepParams, StepType};
use stepwise_types::retry::RetryPolicy;
use thiserror::Error;

use crate::audit::AuditSink;
use crate::repository::DefinitionRepository;

use super::error::EngineError;
use super::handler::HandlerRegistry;

/// Maximum number of forward-compatible keys in a step's `extra` map.
pub const MAX_EXTRA_KEYS: usize = 32;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Steps reference handlers the registry does not know.
    #[error("missing handlers: {}", .0.join(", "))]
    MissingHandlers(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(message: impl Into<String>) -> DefinitionError {
    DefinitionError::Validation(message.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML definition.
pub fn parse_definition_yaml(yaml: &str) -> Result<Definition, DefinitionError> {
    let def: Definition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_definition_yaml(def: &Definition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn load_definition_file(path: &Path) -> Result<Definition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Find every `.yaml` / `.yml` definition directly under `dir`, sorted by
/// path. Files that fail to parse are skipped with a warning.
pub fn discover_definitions(dir: &Path) -> Result<Vec<(PathBuf, Definition)>, DefinitionError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !path.is_file() || !is_yaml {
            continue;
        }
        match load_definition_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid definition file"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition.
///
/// Checks:
/// - tenant and code are non-empty; code is alphanumeric plus `-`, `_`, `.`
/// - version >= 1 and at least one step
/// - step IDs are non-empty and unique
/// - params match the declared step type; custom steps name a handler
/// - every effective retry policy has max_attempts >= 1 and
///   initial_delay_ms <= max_delay_ms
/// - timeouts are > 0 and `extra` stays within `MAX_EXTRA_KEYS`
pub fn validate_definition(def: &Definition) -> Result<(), DefinitionError> {
    if def.tenant_id.trim().is_empty() {
        return Err(invalid("tenant_id must not be empty"));
    }
    if def.code.is_empty() {
        return Err(invalid("definition code must not be empty"));
    }
    if !def
        .code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(format!(
            "definition code '{}' contains invalid characters (alphanumeric, '-', '_', '.' allowed)",
            def.code
        )));
    }
    if def.version == 0 {
        return Err(invalid("version must be >= 1"));
    }
    if def.steps.is_empty() {
        return Err(invalid("definition must have at least one step"));
    }

    validate_policy("definition", &def.policy)?;

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.step_id.trim().is_empty() {
            return Err(invalid("step_id must not be empty"));
        }
        if !seen_ids.insert(step.step_id.as_str()) {
            return Err(invalid(format!("duplicate step ID: '{}'", step.step_id)));
        }

        let params_type = step.params.step_type();
        if params_type != step.step_type {
            return Err(invalid(format!(
                "step '{}' is {} but has {} params",
                step.step_id, step.step_type, params_type
            )));
        }

        match (step.step_type, step.handler_name.as_deref()) {
            (StepType::Custom, None) | (StepType::Custom, Some("")) => {
                return Err(invalid(format!(
                    "custom step '{}' must set handler_name",
                    step.step_id
                )));
            }
            (StepType::Custom, Some(_)) | (_, None) => {}
            (other, Some(_)) => {
                return Err(invalid(format!(
                    "step '{}' is {other}; handler_name is only valid for custom steps",
                    step.step_id
                )));
            }
        }

        validate_params(&step.step_id, &step.params)?;

        if step.timeout_ms == Some(0) {
            return Err(invalid(format!("step '{}' timeout must be > 0", step.step_id)));
        }
        if step.extra.len() > MAX_EXTRA_KEYS {
            return Err(invalid(format!(
                "step '{}' has {} extra keys (max {MAX_EXTRA_KEYS})",
                step.step_id,
                step.extra.len()
            )));
        }

        validate_policy(&format!("step '{}'", step.step_id), &def.effective_policy(step))?;
    }

    Ok(())
}

fn validate_policy(owner: &str, policy: &RetryPolicy) -> Result<(), DefinitionError> {
    if policy.max_attempts == 0 {
        return Err(invalid(format!("{owner}: max_attempts must be >= 1")));
    }
    if policy.initial_delay_ms > policy.max_delay_ms {
        return Err(invalid(format!(
            "{owner}: initial_delay_ms ({}) exceeds max_delay_ms ({})",
            policy.initial_delay_ms, policy.max_delay_ms
        )));
    }
    Ok(())
}

fn validate_params(step_id: &str, params: &StepParams) -> Result<(), DefinitionError> {
    match params {
        StepParams::Email { to, subject, .. } => {
            if to.is_empty() {
                return Err(invalid(format!("email step '{step_id}' needs a recipient")));
            }
            if subject.trim().is_empty() {
                return Err(invalid(format!("email step '{step_id}' needs a subject")));
            }
        }
        StepParams::Notification {
            channel, recipient, ..
        } => {
            if channel.trim().is_empty() || recipient.trim().is_empty() {
                return Err(invalid(format!(
                    "notification step '{step_id}' needs a channel and recipient"
                )));
            }
        }
        StepParams::Webhook { url, method, .. } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(format!(
                    "webhook step '{step_id}' url must be http(s): '{url}'"
                )));
            }
            const METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];
            if !METHODS.contains(&method.to_ascii_uppercase().as_str()) {
                return Err(invalid(format!(
                    "webhook step '{step_id}' has unsupported method '{method}'"
                )));
            }
        }
        StepParams::Delay { .. } | StepParams::Custom { .. } => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DefinitionService
// ---------------------------------------------------------------------------

/// Manages the definition lifecycle on top of a `DefinitionRepository`.
pub struct DefinitionService<R: DefinitionRepository> {
    repo: Arc<R>,
    registry: Option<Arc<HandlerRegistry>>,
    audit: Arc<dyn AuditSink>,
}

impl<R: DefinitionRepository> DefinitionService<R> {
    /// With a registry, publishing also checks that every step has a handler.
    pub fn new(
        repo: Arc<R>,
        registry: Option<Arc<HandlerRegistry>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            repo,
            registry,
            audit,
        }
    }

    /// Store a draft. Creates the version or replaces an existing draft;
    /// published and deprecated versions are immutable.
    pub async fn save_draft(&self, def: &Definition) -> Result<Definition, EngineError> {
        validate_definition(def)?;

        let mut draft = def.clone();
        draft.status = DefinitionStatus::Draft;
        draft.published_at = None;

        if !self.repo.insert_definition(&draft).await?
            && !self.repo.replace_draft_definition(&draft).await?
        {
            let stored = self.require(&def.tenant_id, &def.code, def.version).await?;
            return Err(EngineError::DefinitionImmutable {
                code: stored.code,
                version: stored.version,
                status: stored.status,
            });
        }

        tracing::debug!(code = %draft.code, version = draft.version, "saved draft definition");
        self.require(&def.tenant_id, &def.code, def.version).await
    }

    /// Freeze a draft. Publishing an already published version is a no-op.
    pub async fn publish(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
        actor: &str,
    ) -> Result<Definition, EngineError> {
        let stored = self.require(tenant_id, code, version).await?;
        match stored.status {
            DefinitionStatus::Published => return Ok(stored),
            DefinitionStatus::Deprecated => {
                return Err(EngineError::DefinitionImmutable {
                    code: stored.code,
                    version: stored.version,
                    status: stored.status,
                });
            }
            DefinitionStatus::Draft => {}
        }

        validate_definition(&stored)?;
        if let Some(registry) = &self.registry {
            let missing = registry.missing_handlers(&stored);
            if !missing.is_empty() {
                return Err(DefinitionError::MissingHandlers(missing).into());
            }
        }

        let published_at = Utc::now();
        let moved = self
            .repo
            .transition_definition_status(
                tenant_id,
                code,
                version,
                DefinitionStatus::Draft,
                DefinitionStatus::Published,
                Some(published_at),
            )
            .await?;

        let current = self.require(tenant_id, code, version).await?;
        if moved {
            tracing::info!(code, version, "published definition");
            self.audit.emit(AuditEvent::new(
                DEFINITION_PUBLISHED,
                actor,
                "definition",
                format!("{code}@{version}"),
                serde_json::json!({
                    "tenant_id": tenant_id,
                    "code": code,
                    "version": version,
                    "steps": current.steps.len(),
                }),
            ));
        } else if current.status != DefinitionStatus::Published {
            return Err(EngineError::DefinitionImmutable {
                code: current.code,
                version: current.version,
                status: current.status,
            });
        }
        Ok(current)
    }

    /// Store and publish in one call: the CLI's `definition publish <file>`.
    pub async fn save_and_publish(
        &self,
        def: &Definition,
        actor: &str,
    ) -> Result<Definition, EngineError> {
        match self.save_draft(def).await {
            Ok(_) | Err(EngineError::DefinitionImmutable { .. }) => {}
            Err(e) => return Err(e),
        }
        self.publish(&def.tenant_id, &def.code, def.version, actor)
            .await
    }

    /// Retire a published version. New executions can no longer pin it.
    pub async fn deprecate(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
    ) -> Result<Definition, EngineError> {
        let stored = self.require(tenant_id, code, version).await?;
        match stored.status {
            DefinitionStatus::Deprecated => return Ok(stored),
            DefinitionStatus::Draft => {
                return Err(EngineError::DefinitionNotPublished {
                    code: stored.code,
                    version: stored.version,
                    status: stored.status,
                });
            }
            DefinitionStatus::Published => {}
        }

        self.repo
            .transition_definition_status(
                tenant_id,
                code,
                version,
                DefinitionStatus::Published,
                DefinitionStatus::Deprecated,
                None,
            )
            .await?;
        tracing::info!(code, version, "deprecated definition");
        self.require(tenant_id, code, version).await
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
    ) -> Result<Option<Definition>, EngineError> {
        Ok(self.repo.get_definition(tenant_id, code, version).await?)
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Definition>, EngineError> {
        Ok(self.repo.list_definitions(tenant_id).await?)
    }

    async fn require(
        &self,
        tenant_id: &str,
        code: &str,
        version: u32,
    ) -> Result<Definition, EngineError> {
        self.repo
            .get_definition(tenant_id, code, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                code: code.to_string(),
                version,
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
