//! Error taxonomy surfaced by every engine operation.

use thiserror::Error;

use crate::model::{ConfigViolation, Id};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, schema or invariant violation, illegal state transition.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        violations: Vec<ConfigViolation>,
    },

    /// Entity absent, or present but not visible to the acting user.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: Id },

    /// Duplicate edge, or a write that kept losing concurrent races.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Stored snapshot payload could not be decoded under the current format.
    #[error("snapshot '{snapshot_id}' is corrupt: {reason}")]
    CorruptSnapshot { snapshot_id: Id, reason: String },

    /// A blueprint or block references a type that is no longer available.
    #[error("block definition '{definition_id}' is not available")]
    MissingBlockDefinition { definition_id: Id },

    /// Failure reported by the persistence layer.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
            violations: Vec::new(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, violations: Vec<ConfigViolation>) -> Self {
        EngineError::Validation {
            message: message.into(),
            violations,
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<Id>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn corrupt(snapshot_id: impl Into<Id>, reason: impl std::fmt::Display) -> Self {
        EngineError::CorruptSnapshot {
            snapshot_id: snapshot_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_definition(definition_id: impl Into<Id>) -> Self {
        EngineError::MissingBlockDefinition {
            definition_id: definition_id.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}
