//! Error types for the PersonaKit core.
//!
//! The taxonomy separates caller-visible failures (validation, missing
//! configuration) from failures that are recovered locally (provider
//! timeouts fail closed, outbox handler errors are retried). Condition-level
//! evaluation problems are not errors at all; they surface as
//! [`crate::engine::EvaluationWarning`] values.

use thiserror::Error;
use uuid::Uuid;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PersonaKitError>;

/// Top-level error type for PersonaKit operations.
#[derive(Debug, Error)]
pub enum PersonaKitError {
    /// A mapper document failed schema validation at upload.
    #[error("invalid mapper document: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// No active mapper version exists for the requested config id.
    #[error("no active mapper configuration for '{config_id}'")]
    ConfigNotFound { config_id: String },

    /// A specific record was not found.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The embedding provider (or a search depending on it) exceeded its deadline.
    #[error("embedding provider timed out during {operation}")]
    ProviderTimeout { operation: String },

    /// The embedding provider returned an error response.
    #[error("embedding provider error: {message}")]
    Provider { message: String },

    /// An outbox handler failed; the event will be retried or marked failed.
    #[error("outbox handler failed for event {event_id}: {message}")]
    OutboxHandlerFailure { event_id: Uuid, message: String },

    /// Underlying SQLite error.
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A mapper document could not be parsed as YAML.
    #[error("malformed mapper document: {0}")]
    DocumentParse(#[from] serde_yaml::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Filesystem error while preparing storage paths.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersonaKitError {
    /// Build a validation error from a list of messages.
    pub fn validation(errors: Vec<String>) -> Self {
        Self::Validation { errors }
    }
}
