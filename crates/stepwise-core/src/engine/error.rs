use stepwise_types::definition::DefinitionStatus;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::ExecutionStatus;
use thiserror::Error;
use uuid::Uuid;

use super::definition::DefinitionError;

/// Errors surfaced by engine operations.
///
/// Handler failures are never returned here: they are classified, persisted
/// on the attempt and routed through retry or the DLQ.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("definition {code} v{version} not found")]
    DefinitionNotFound { code: String, version: u32 },

    #[error("definition {code} v{version} is {status}, not published")]
    DefinitionNotPublished {
        code: String,
        version: u32,
        status: DefinitionStatus,
    },

    #[error("definition {code} v{version} is {status} and cannot be modified")]
    DefinitionImmutable {
        code: String,
        version: u32,
        status: DefinitionStatus,
    },

    #[error("invalid definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("no handler registered for {0}")]
    HandlerNotRegistered(String),

    #[error("tenant mismatch: expected '{expected}', got '{actual}'")]
    TenantMismatch { expected: String, actual: String },

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("execution {execution_id} is {status}")]
    ExecutionNotActive {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Fail with `TenantMismatch` unless both tenants are equal.
    pub fn check_tenant(expected: &str, actual: &str) -> Result<(), EngineError> {
        if expected == actual {
            Ok(())
        } else {
            Err(EngineError::TenantMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_tenant() {
        assert!(EngineError::check_tenant("acme", "acme").is_ok());
        let err = EngineError::check_tenant("acme", "globex").unwrap_err();
        assert_eq!(err.to_string(), "tenant mismatch: expected 'acme', got 'globex'");
    }

    #[test]
    fn test_not_published_display() {
        let err = EngineError::DefinitionNotPublished {
            code: "welcome".to_string(),
            version: 3,
            status: DefinitionStatus::Draft,
        };
        assert_eq!(err.to_string(), "definition welcome v3 is draft, not published");
    }
}
