//! Persistence layer for the session orchestrator.
//!
//! Two kinds of files live under the orchestrator root:
//!
//! - snapshots (`state/*.json`) rewritten whole with write-temp-then-rename,
//!   so a crash never leaves a partially written table;
//! - append-only JSON-lines logs (`conversations/*.jsonl`, `logs/*.jsonl`).
//!
//! # Example
//!
//! ```no_run
//! use orchestrator_persistence::{StateStore, WorkerTable};
//!
//! let store = StateStore::new("/var/lib/orchestrator");
//! let mut table = store.load_worker_table()?;
//! table.workers.retain(|w| w.state.is_live());
//! store.save_worker_table(&table)?;
//! # Ok::<(), orchestrator_persistence::PersistenceError>(())
//! ```

pub mod atomic;
pub mod audit;
pub mod conversation_log;
pub mod error;
pub mod jsonl;
pub mod state_store;

pub use audit::{AuditLog, CommunicationRecord, RejectedMessage};
pub use conversation_log::{ConversationLog, LogEntry};
pub use error::{PersistenceError, Result};
pub use state_store::{StateStore, WorkerTable};
