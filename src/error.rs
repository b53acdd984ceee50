//! Error types for Magnus Opus.

use uuid::Uuid;

use crate::worker::state::TaskStatus;

/// Top-level error type for the supervisor and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Failures reported by the remote session service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Session request {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("Session {session_id} not found")]
    NotFound { session_id: String },

    #[error("Session service unavailable: {0}")]
    Unavailable(String),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: TaskStatus,
        target: TaskStatus,
    },

    #[error("Failed to launch task in category {category}: {source}")]
    LaunchFailed {
        category: String,
        #[source]
        source: SessionError,
    },

    #[error("Session {session_id} is already driven by running task {id}")]
    AlreadyRunning { id: Uuid, session_id: String },

    #[error("Supervisor is shut down")]
    ShutDown,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
