//! Per-worker append-only conversation logs.

use std::fs;
use std::path::{Path, PathBuf};

use orchestrator_models::{Message, MessageId, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, Result};
use crate::jsonl::{append_record, read_records};

const CONVERSATIONS_DIR: &str = "conversations";

/// One line of a conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogEntry {
    /// A message appended to the conversation.
    Message { message: Message },
    /// A compaction: `replaced` messages were folded into `summary`.
    Compaction {
        summary: Message,
        replaced: Vec<MessageId>,
    },
}

/// Stores conversation logs as `<root>/conversations/<worker_id>.jsonl`.
///
/// Files are only ever appended to. Compaction is recorded as its own entry
/// and applied on replay, so the raw history stays on disk for audit.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    dir: PathBuf,
}

impl ConversationLog {
    /// Creates a log store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(CONVERSATIONS_DIR),
        }
    }

    /// Path of one worker's log.
    pub fn path(&self, worker_id: &WorkerId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", worker_id))
    }

    pub fn append(&self, worker_id: &WorkerId, entry: &LogEntry) -> Result<()> {
        append_record(&self.path(worker_id), entry)
    }

    /// Reads every entry for a worker, oldest first.
    pub fn load(&self, worker_id: &WorkerId) -> Result<Vec<LogEntry>> {
        read_records(&self.path(worker_id))
    }

    /// Lists the workers that have a log on disk.
    pub fn workers(&self) -> Result<Vec<WorkerId>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let read_err = |source| PersistenceError::ReadError {
            path: self.dir.clone(),
            source,
        };

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(WorkerId::from(stem));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
