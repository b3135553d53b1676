//! Error types for the orchestrator runtime.

use std::fmt;
use std::time::Duration;

use orchestrator_conversation::ConversationError;
use orchestrator_models::{GapId, MessageId, Role, WorkerId};
use orchestrator_persistence::PersistenceError;
use orchestrator_tmux::BackendError;
use thiserror::Error;

/// Why the router refused a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationReason {
    EmptyBody,
    BodyTooLong { len: usize, max: usize },
    /// `Broadcast` messages must go through `broadcast`, not `send`.
    BroadcastViaSend,
    /// A `TaskCompletion` must name the assignment it completes.
    MissingReplyTarget,
    /// Compaction summaries are never routed.
    SyntheticMessage,
    UnknownSender(WorkerId),
    UnauthorizedRoute { from: Role, to: Role },
    UnauthorizedBroadcast,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationReason::EmptyBody => write!(f, "empty body"),
            ViolationReason::BodyTooLong { len, max } => {
                write!(f, "body too long ({} > {} bytes)", len, max)
            }
            ViolationReason::BroadcastViaSend => write!(f, "broadcast kind sent directly"),
            ViolationReason::MissingReplyTarget => write!(f, "task completion without reply target"),
            ViolationReason::SyntheticMessage => write!(f, "synthetic message"),
            ViolationReason::UnknownSender(id) => write!(f, "unknown sender {}", id),
            ViolationReason::UnauthorizedRoute { from, to } => {
                write!(f, "unauthorized route {} -> {}", from, to)
            }
            ViolationReason::UnauthorizedBroadcast => write!(f, "unauthorized broadcast"),
        }
    }
}

/// Errors that can occur in the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The backend could not start or confirm a worker process.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// A session with this name exists but is not managed by the orchestrator.
    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// `session:window` target does not exist.
    #[error("target '{0}' not found")]
    TargetNotFound(String),

    #[error("unknown recipient: {0}")]
    UnknownRecipient(WorkerId),

    #[error("protocol violation: {0}")]
    ProtocolViolation(ViolationReason),

    /// A backend call did not finish within the configured timeout.
    #[error("{operation} timed out after {timeout:?}")]
    DeliveryTimeout {
        operation: String,
        timeout: Duration,
    },

    /// Compaction could not find a cut that keeps every open message.
    #[error("summarization conflict for {worker_id}: open message {message_id} would be dropped")]
    SummarizationConflict {
        worker_id: WorkerId,
        message_id: MessageId,
    },

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("gap not found: {0}")]
    GapNotFound(GapId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend error: {0}")]
    Backend(BackendError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("conversation error: {0}")]
    Conversation(ConversationError),

    #[error("runtime already started")]
    AlreadyStarted,

    #[error("runtime not started")]
    NotStarted,

    #[error("shutdown error: {0}")]
    Shutdown(String),

    /// Lock poisoned (thread panicked while holding lock).
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl OrchestratorError {
    /// True for errors a recovery strategy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DeliveryTimeout { .. } | OrchestratorError::SpawnFailed(_)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::SessionNotFound(_)
            | OrchestratorError::TargetNotFound(_)
            | OrchestratorError::UnknownRecipient(_)
            | OrchestratorError::WorkerNotFound(_)
            | OrchestratorError::GapNotFound(_) => 2,
            OrchestratorError::ProtocolViolation(_) => 3,
            _ => 1,
        }
    }
}

impl From<BackendError> for OrchestratorError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::SessionExists(name) => OrchestratorError::SessionExists(name),
            BackendError::SessionNotFound(name) => OrchestratorError::SessionNotFound(name),
            BackendError::TargetNotFound(target) => OrchestratorError::TargetNotFound(target),
            other => OrchestratorError::Backend(other),
        }
    }
}

impl From<ConversationError> for OrchestratorError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::SummarizationConflict {
                worker_id,
                message_id,
            } => OrchestratorError::SummarizationConflict {
                worker_id,
                message_id,
            },
            ConversationError::Persistence(e) => OrchestratorError::Persistence(e),
            ConversationError::LockPoisoned(e) => OrchestratorError::LockPoisoned(e),
            other => OrchestratorError::Conversation(other),
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
