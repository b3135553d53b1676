//! Wires the components together over one state directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use orchestrator_conversation::{ConversationStore, ExtractiveSummarizer, Summarizer};
use orchestrator_persistence::{AuditLog, StateStore};
use orchestrator_tmux::SessionBackend;
use tokio::sync::broadcast;
use tracing::info;

use crate::backend::TimedBackend;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::event::RuntimeEvent;
use crate::health::{DefaultRecovery, HealthMonitor, RecoveryStrategy};
use crate::poller::OutputPoller;
use crate::router::MessageRouter;
use crate::scheduler::Scheduler;
use crate::supervisor::ProcessSupervisor;

/// Capacity of the runtime event channel.
const EVENT_CAPACITY: usize = 1024;

/// Every component, sharing one backend, one state root and one event bus.
pub struct Orchestrator {
    root: PathBuf,
    config: RuntimeConfig,
    supervisor: Arc<ProcessSupervisor>,
    conversations: Arc<ConversationStore>,
    router: Arc<MessageRouter>,
    health: Arc<HealthMonitor>,
    scheduler: Arc<Scheduler>,
    poller: Arc<OutputPoller>,
    events: broadcast::Sender<RuntimeEvent>,
}

/// Builder for [`Orchestrator`] with replaceable policies.
pub struct OrchestratorBuilder {
    root: PathBuf,
    config: RuntimeConfig,
    backend: Arc<dyn SessionBackend>,
    summarizer: Arc<dyn Summarizer>,
    strategy: Option<Arc<dyn RecoveryStrategy>>,
}

impl OrchestratorBuilder {
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Replaces the restart-then-escalate recovery policy.
    pub fn recovery_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = StateStore::new(&self.root);
        let backend = TimedBackend::new(self.backend, self.config.backend_timeout);

        let supervisor = Arc::new(
            ProcessSupervisor::open(
                backend,
                store.clone(),
                self.config.launch_commands.clone(),
                events.clone(),
            )?
            .with_heartbeat_flush(self.config.heartbeat_interval / 2),
        );
        let conversations = Arc::new(ConversationStore::open(
            &self.root,
            self.config.budget(),
            self.summarizer,
        )?);
        let router = Arc::new(MessageRouter::new(
            supervisor.clone(),
            conversations.clone(),
            AuditLog::new(&self.root),
            events.clone(),
            self.config.max_body_len,
        ));
        let strategy = self
            .strategy
            .unwrap_or_else(|| {
                Arc::new(
                    DefaultRecovery::new(supervisor.clone())
                        .with_max_restarts(self.config.max_restart_attempts),
                )
            });
        let health = Arc::new(HealthMonitor::open(
            supervisor.clone(),
            router.clone(),
            strategy,
            store.clone(),
            events.clone(),
            self.config.heartbeat_interval,
        )?);
        let scheduler = Arc::new(Scheduler::open(
            supervisor.clone(),
            router.clone(),
            store,
            events.clone(),
        )?);
        let poller = Arc::new(OutputPoller::new(supervisor.clone(), self.config.capture_lines));
        router.observe_deliveries(poller.clone());

        info!(root = %self.root.display(), "orchestrator opened");
        Ok(Orchestrator {
            root: self.root,
            config: self.config,
            supervisor,
            conversations,
            router,
            health,
            scheduler,
            poller,
            events,
        })
    }
}

impl Orchestrator {
    /// Starts a builder for the state directory `root`.
    pub fn builder(root: impl AsRef<Path>, config: RuntimeConfig, backend: Arc<dyn SessionBackend>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            root: root.as_ref().to_path_buf(),
            config,
            backend,
            summarizer: Arc::new(ExtractiveSummarizer),
            strategy: None,
        }
    }

    /// Opens with the default summarizer and recovery strategy.
    pub fn open(root: impl AsRef<Path>, config: RuntimeConfig, backend: Arc<dyn SessionBackend>) -> Result<Self> {
        Self::builder(root, config, backend).build()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn poller(&self) -> &Arc<OutputPoller> {
        &self.poller
    }

    /// Subscribes to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }
}
