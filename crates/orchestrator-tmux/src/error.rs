//! Error types for backend operations.

use thiserror::Error;

/// Errors that can occur during backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// tmux not found in PATH.
    #[error("tmux not found in PATH")]
    NotFound,

    /// A session with this name exists but is not managed by us.
    #[error("session '{0}' already exists")]
    SessionExists(String),

    /// Session not found.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Window target (`session:index`) not found.
    #[error("target '{0}' not found")]
    TargetNotFound(String),

    /// Session or window name rejected before reaching the backend.
    #[error("invalid name '{0}': must be non-empty without ':', '.' or whitespace")]
    InvalidName(String),

    /// tmux command failed.
    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    /// Backend refused the operation (used by the in-memory backend).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse tmux output.
    #[error("parse error: {0}")]
    ParseError(String),
}

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
