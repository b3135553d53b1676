//! Error types for conversation operations.

use orchestrator_models::{MessageId, WorkerId};
use orchestrator_persistence::PersistenceError;
use thiserror::Error;

/// Errors that can occur while appending to or compacting conversations.
#[derive(Error, Debug)]
pub enum ConversationError {
    /// Every candidate cut would drop an open assignment or escalation.
    #[error("cannot summarize conversation for {worker_id}: summary omits open message {message_id}")]
    SummarizationConflict {
        worker_id: WorkerId,
        message_id: MessageId,
    },

    /// The summarizer itself failed.
    #[error("summarizer failed: {0}")]
    Summarizer(String),

    /// Persistence error.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Lock poisoned (thread panicked while holding lock).
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result type alias for conversation operations.
pub type Result<T> = std::result::Result<T, ConversationError>;
