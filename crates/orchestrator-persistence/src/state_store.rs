//! Snapshot files for the worker table, gap events and pending check-ins.

use std::path::{Path, PathBuf};

use orchestrator_models::{GapEvent, ScheduledCheckIn, Session, Worker};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic::{atomic_write_json, read_json_optional};
use crate::error::Result;

const STATE_DIR: &str = "state";
const WORKERS_FILE: &str = "workers.json";
const GAPS_FILE: &str = "gaps.json";
const SCHEDULE_FILE: &str = "schedule.json";

/// Everything the supervisor owns, written as one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerTable {
    /// Known sessions with their windows.
    #[serde(default)]
    pub sessions: Vec<Session>,
    /// Supervised workers, including stopped ones until archived.
    #[serde(default)]
    pub workers: Vec<Worker>,
}

/// Reads and writes the snapshot files under `<root>/state/`.
///
/// ```text
/// root/
/// └── state/
///     ├── workers.json
///     ├── gaps.json
///     └── schedule.json
/// ```
///
/// Each file is rewritten whole and atomically on every save.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            state_dir: root.as_ref().join(STATE_DIR),
        }
    }

    /// Directory holding the snapshot files.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the worker table snapshot.
    pub fn workers_path(&self) -> PathBuf {
        self.state_dir.join(WORKERS_FILE)
    }

    pub fn save_worker_table(&self, table: &WorkerTable) -> Result<()> {
        debug!(
            sessions = table.sessions.len(),
            workers = table.workers.len(),
            "saving worker table"
        );
        atomic_write_json(&self.workers_path(), table)
    }

    /// Loads the worker table, empty if it was never saved.
    pub fn load_worker_table(&self) -> Result<WorkerTable> {
        Ok(read_json_optional(&self.workers_path())?.unwrap_or_default())
    }

    pub fn save_gaps(&self, gaps: &[GapEvent]) -> Result<()> {
        atomic_write_json(&self.state_dir.join(GAPS_FILE), &gaps)
    }

    pub fn load_gaps(&self) -> Result<Vec<GapEvent>> {
        Ok(read_json_optional(&self.state_dir.join(GAPS_FILE))?.unwrap_or_default())
    }

    pub fn save_schedule(&self, pending: &[ScheduledCheckIn]) -> Result<()> {
        atomic_write_json(&self.state_dir.join(SCHEDULE_FILE), &pending)
    }

    pub fn load_schedule(&self) -> Result<Vec<ScheduledCheckIn>> {
        Ok(read_json_optional(&self.state_dir.join(SCHEDULE_FILE))?.unwrap_or_default())
    }
}
