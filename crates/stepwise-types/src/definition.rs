//! Workflow definition types.
//!
//! A `Definition` is a tenant-scoped, versioned, ordered list of steps plus
//! default retry policy. Once published its steps and policies are frozen; a
//! change requires a new version. Executions always pin a `(code, version)`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;
use crate::retry::{RetryOverride, RetryPolicy};

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A versioned workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// Owning tenant.
    pub tenant_id: String,
    /// Stable name shared by all versions (e.g. "order-confirmation").
    pub code: String,
    /// Monotonic version number, unique per `(tenant_id, code)`.
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<StepDef>,
    /// Default retry policy for every step.
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub status: DefinitionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Free-form metadata the engine does not interpret.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Definition {
    /// Look up a step by its ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }

    /// The retry policy a step actually runs with.
    pub fn effective_policy(&self, step: &StepDef) -> RetryPolicy {
        match &step.retry {
            Some(ov) => self.policy.with_override(ov),
            None => self.policy.clone(),
        }
    }
}

/// Lifecycle of a definition version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Published,
    Deprecated,
}

impl DefinitionStatus {
    pub const ALL: [DefinitionStatus; 3] = [
        DefinitionStatus::Draft,
        DefinitionStatus::Published,
        DefinitionStatus::Deprecated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionStatus::Draft => "draft",
            DefinitionStatus::Published => "published",
            DefinitionStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefinitionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DefinitionStatus::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("definition status", s))
    }
}

// ---------------------------------------------------------------------------
// StepDef
// ---------------------------------------------------------------------------

/// A single step in a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Unique within the definition.
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Namespaced handler key, required for `custom` steps (e.g. "billing.refund").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,
    /// Typed parameters; the variant must match `step_type`.
    pub params: StepParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverride>,
    /// Handler call timeout in milliseconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Forward-compatible fields the engine does not understand yet.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Email,
    Notification,
    Webhook,
    Delay,
    Custom,
}

impl StepType {
    pub const ALL: [StepType; 5] = [
        StepType::Email,
        StepType::Notification,
        StepType::Webhook,
        StepType::Delay,
        StepType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Email => "email",
            StepType::Notification => "notification",
            StepType::Webhook => "webhook",
            StepType::Delay => "delay",
            StepType::Custom => "custom",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("step type", s))
    }
}

/// Step parameters, internally tagged by `type`:
/// ```yaml
/// params:
///   type: delay
///   duration_ms: 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepParams {
    Email {
        to: Vec<String>,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        variables: BTreeMap<String, serde_json::Value>,
    },
    Notification {
        channel: String,
        recipient: String,
        message: String,
    },
    Webhook {
        url: String,
        #[serde(default = "default_webhook_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    Delay {
        duration_ms: u64,
    },
    Custom {
        #[serde(default)]
        payload: serde_json::Value,
    },
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

impl StepParams {
    /// The step type these parameters belong to.
    pub fn step_type(&self) -> StepType {
        match self {
            StepParams::Email { .. } => StepType::Email,
            StepParams::Notification { .. } => StepType::Notification,
            StepParams::Webhook { .. } => StepType::Webhook,
            StepParams::Delay { .. } => StepType::Delay,
            StepParams::Custom { .. } => StepType::Custom,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
