//! Output poller: pane output changes count as worker activity.
//!
//! Text the router typed into a pane is echoed back by the terminal. Those
//! lines are ignored when comparing captures, so a delivery to a worker
//! never reads as a heartbeat from it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use orchestrator_models::{WorkerId, WorkerState};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::error::{OrchestratorError, Result};
use crate::router::DeliveryObserver;
use crate::supervisor::ProcessSupervisor;

/// Delivered lines remembered per worker.
const ECHO_MEMORY: usize = 256;

/// Lines of `output` that did not come from a delivery.
fn own_lines<'a>(output: &'a str, echoes: Option<&HashSet<String>>) -> Vec<&'a str> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .filter(|line| echoes.map_or(true, |e| !e.contains(line.trim())))
        .collect()
}

#[derive(Debug, Default)]
struct Echoes {
    order: VecDeque<String>,
    lines: HashSet<String>,
}

impl Echoes {
    fn remember(&mut self, text: &str) {
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if self.lines.insert(line.to_string()) {
                self.order.push_back(line.to_string());
            }
        }
        while self.order.len() > ECHO_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.lines.remove(&oldest);
            }
        }
    }
}

/// Captures each live worker's pane and records activity when it changes.
pub struct OutputPoller {
    supervisor: Arc<ProcessSupervisor>,
    capture_lines: u32,
    /// Last captured output per worker.
    last_output: Mutex<HashMap<WorkerId, String>>,
    echoes: StdMutex<HashMap<WorkerId, Echoes>>,
}

impl OutputPoller {
    pub fn new(supervisor: Arc<ProcessSupervisor>, capture_lines: u32) -> Self {
        Self {
            supervisor,
            capture_lines,
            last_output: Mutex::new(HashMap::new()),
            echoes: StdMutex::new(HashMap::new()),
        }
    }

    /// Reports whether `output` shows lines the worker wrote since `previous`.
    ///
    /// Delivered lines are dropped first. Lines scrolling off the top of the
    /// capture are not a change.
    fn worker_wrote(&self, worker_id: &WorkerId, previous: &str, output: &str) -> Result<bool> {
        let echoes = self
            .echoes
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?;
        let echoes = echoes.get(worker_id).map(|e| &e.lines);
        let before = own_lines(previous, echoes);
        let now = own_lines(output, echoes);
        Ok(!before.ends_with(&now))
    }

    /// Polls every running or unresponsive worker once.
    ///
    /// The first capture of a worker only sets a baseline. Returns the
    /// workers that wrote new output.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Vec<WorkerId>> {
        let workers = self.supervisor.workers()?;
        let mut last_output = self.last_output.lock().await;
        last_output.retain(|id, _| workers.iter().any(|w| &w.id == id && w.state != WorkerState::Stopped));
        self.echoes
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?
            .retain(|id, _| workers.iter().any(|w| &w.id == id));

        let mut active = Vec::new();
        for worker in workers
            .iter()
            .filter(|w| matches!(w.state, WorkerState::Running | WorkerState::Unresponsive))
        {
            trace!(worker_id = %worker.id, target = %worker.target(), "polling worker");

            let output = match self
                .supervisor
                .backend()
                .capture_pane(&worker.session, worker.window, self.capture_lines)
                .await
            {
                Ok(o) => o,
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "failed to capture output");
                    continue;
                }
            };

            let changed = match last_output.insert(worker.id.clone(), output.clone()) {
                Some(previous) if previous != output => self.worker_wrote(&worker.id, &previous, &output)?,
                _ => false,
            };
            if changed {
                trace!(worker_id = %worker.id, "output changed");
                self.supervisor.record_activity(&worker.id, now)?;
                active.push(worker.id.clone());
            }
        }
        Ok(active)
    }
}

impl DeliveryObserver for OutputPoller {
    fn delivered(&self, worker_id: &WorkerId, text: &str) {
        match self.echoes.lock() {
            Ok(mut echoes) => echoes.entry(worker_id.clone()).or_default().remember(text),
            Err(e) => warn!(worker_id = %worker_id, error = %e, "could not remember delivered text"),
        }
    }
}
