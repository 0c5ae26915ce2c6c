//! Error taxonomy shared by the pipeline, coordinator, and approval gate.
//!
//! Every failure carries a kind that decides two things: the wire code a
//! caller sees in a protocol response, and whether the stage pipeline may
//! retry the operation that produced it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the core
pub type Result<T, E = CoordError> = std::result::Result<T, E>;

/// Errors produced by core operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    /// Missing or malformed input; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Entity absent; never retried
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Permission check failed closed; always audited, never retried
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Status change outside the allowed table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Capacity exhausted; may clear after reallocation
    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Conflicting work; may clear after conflict resolution
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Deadline exceeded or cancelled
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Circuit breaker is open for the stage type
    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),

    /// Collaborator or serialization failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFoundError,
            Self::PermissionDenied(_) => ErrorCode::PermissionDeniedError,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransitionError,
            Self::ResourceExhaustion(_) => ErrorCode::ResourceExhaustionError,
            Self::Conflict(_) => ErrorCode::ConflictError,
            Self::Timeout(_) => ErrorCode::TimeoutError,
            Self::CircuitOpen(_) => ErrorCode::CircuitOpenError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Only transient kinds are retried by the stage pipeline
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhaustion(_) | Self::Conflict(_) | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

impl From<std::io::Error> for CoordError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {}", err))
    }
}

/// Stable error codes exposed in protocol responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ValidationError,
    NotFoundError,
    PermissionDeniedError,
    InvalidStateTransitionError,
    ResourceExhaustionError,
    ConflictError,
    TimeoutError,
    CircuitOpenError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::NotFoundError => "NotFoundError",
            Self::PermissionDeniedError => "PermissionDeniedError",
            Self::InvalidStateTransitionError => "InvalidStateTransitionError",
            Self::ResourceExhaustionError => "ResourceExhaustionError",
            Self::ConflictError => "ConflictError",
            Self::TimeoutError => "TimeoutError",
            Self::CircuitOpenError => "CircuitOpenError",
            Self::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
