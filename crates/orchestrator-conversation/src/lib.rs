//! Per-worker conversation history for the session orchestrator.
//!
//! Every message routed to a worker is appended to that worker's
//! conversation. When a conversation grows past its [`Budget`], the oldest
//! messages are folded into one synthetic summary while the most recent ones
//! stay verbatim. Unanswered task assignments and escalations are never lost:
//! a summary that fails to mention one of them by id is rejected and the cut
//! is moved back.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orchestrator_conversation::{Budget, ConversationStore, ExtractiveSummarizer};
//! use orchestrator_models::{Address, Message, WorkerId};
//!
//! # async fn demo() -> orchestrator_conversation::Result<()> {
//! let store = ConversationStore::open(".", Budget::default(), Arc::new(ExtractiveSummarizer))?;
//! let worker = WorkerId::from("executor-1a2b3c4d");
//! store.append(&worker, Message::task(Address::external("cli"), worker.clone(), "implement X")).await?;
//! store.summarize(&worker).await?;
//! # Ok(())
//! # }
//! ```

pub mod conversation;
pub mod error;
pub mod store;
pub mod summarizer;

pub use conversation::{safe_cut, Conversation};
pub use error::{ConversationError, Result};
pub use store::{Budget, Compaction, ConversationStore};
pub use summarizer::{ExtractiveSummarizer, Summarizer, CHARS_PER_TOKEN, SUMMARY_HEADER};
