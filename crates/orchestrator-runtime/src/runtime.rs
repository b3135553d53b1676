//! Main runtime: the background tasks driving an [`Orchestrator`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestrator_models::Message;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Orchestrator;

/// Capacity of the inbound message queue.
const INBOX_CAPACITY: usize = 256;

/// Runs inbound delivery, health sweeps, scheduler ticks and output polling
/// as independent tasks, so a slow summarization never delays heartbeat
/// detection.
pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Option<mpsc::Receiver<Message>>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: bool,
}

impl Runtime {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            orchestrator,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            handles: Vec::new(),
            shutdown_tx,
            shutdown_rx,
            started: false,
        }
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// Queue for messages to route in the background.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.inbox_tx.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Spawns the background tasks.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(OrchestratorError::AlreadyStarted);
        }
        let inbox = self.inbox_rx.take().ok_or(OrchestratorError::AlreadyStarted)?;

        info!("starting runtime");
        let config = self.orchestrator.config().clone();

        let orch = Arc::clone(&self.orchestrator);
        let shutdown = self.shutdown_rx.clone();
        self.handles
            .push(("inbox", tokio::spawn(run_inbox(orch, inbox, shutdown))));

        let orch = Arc::clone(&self.orchestrator);
        self.handles.push((
            "health",
            tokio::spawn(run_periodic("health", config.sweep_interval, self.shutdown_rx.clone(), move || {
                let orch = Arc::clone(&orch);
                async move {
                    if let Err(e) = orch.health().sweep(Utc::now()).await {
                        warn!(error = %e, "health sweep failed");
                    }
                }
            })),
        ));

        let orch = Arc::clone(&self.orchestrator);
        self.handles.push((
            "scheduler",
            tokio::spawn(run_periodic("scheduler", config.scheduler_tick, self.shutdown_rx.clone(), move || {
                let orch = Arc::clone(&orch);
                async move {
                    if let Err(e) = orch.scheduler().tick(Utc::now()).await {
                        warn!(error = %e, "scheduler tick failed");
                    }
                }
            })),
        ));

        let orch = Arc::clone(&self.orchestrator);
        self.handles.push((
            "poller",
            tokio::spawn(run_periodic("poller", config.poll_interval, self.shutdown_rx.clone(), move || {
                let orch = Arc::clone(&orch);
                async move {
                    if let Err(e) = orch.poller().poll_once(Utc::now()).await {
                        warn!(error = %e, "output poll failed");
                    }
                }
            })),
        ));

        self.started = true;
        debug!(tasks = self.handles.len(), "runtime started");
        Ok(())
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.started {
            return Err(OrchestratorError::NotStarted);
        }

        info!("shutting down runtime");
        self.shutdown_tx
            .send(true)
            .map_err(|e| OrchestratorError::Shutdown(format!("failed to send shutdown signal: {}", e)))?;

        for (name, handle) in self.handles.drain(..) {
            debug!(task = name, "waiting for task to stop");
            handle
                .await
                .map_err(|e| OrchestratorError::Shutdown(format!("{} task panicked: {}", name, e)))?;
        }

        if let Err(e) = self.orchestrator.supervisor().checkpoint() {
            warn!(error = %e, "final checkpoint failed");
        }
        self.started = false;
        info!("runtime stopped");
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.started {
            let _ = self.shutdown_tx.send(true);
        }
    }
}

async fn run_inbox(orch: Arc<Orchestrator>, mut inbox: mpsc::Receiver<Message>, mut shutdown: watch::Receiver<bool>) {
    debug!("inbox task started");
    loop {
        tokio::select! {
            maybe = inbox.recv() => {
                let Some(message) = maybe else { break };
                let id = message.id.clone();
                if let Err(e) = orch.router().send(message).await {
                    warn!(message_id = %id, error = %e, "queued message not routed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("inbox received shutdown signal");
                    break;
                }
            }
        }
    }
    debug!("inbox task stopped");
}

async fn run_periodic<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(task = name, period_ms = period.as_millis() as u64, "periodic task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => step().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(task = name, "received shutdown signal");
                    break;
                }
            }
        }
    }
    debug!(task = name, "periodic task stopped");
}
