//! Health monitoring and gap detection.
//!
//! Per worker, with heartbeat interval `T`:
//!
//! ```text
//! Running --(silent > T)--> Unresponsive --(activity)--> Running
//! Unresponsive --(silent > 2T)--> gap flagged, RecoveryStrategy invoked
//! ```
//!
//! Gaps are never deleted. A gap resolves once the worker is Running and has
//! shown activity after the gap was detected. An acknowledged gap stays open
//! but gets no further automatic recovery.
//!
//! `state/gaps.json` is reloaded before each sweep and query so that
//! acknowledgements written by another process are kept.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orchestrator_models::{Address, GapEvent, GapId, Message, Priority, Role, Worker, WorkerId, WorkerState};
use orchestrator_persistence::StateStore;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::event::RuntimeEvent;
use crate::router::MessageRouter;
use crate::supervisor::ProcessSupervisor;

/// Sender name used for escalation messages.
pub const HEALTH_MONITOR_SENDER: &str = "health-monitor";

/// Result of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Recovery was attempted; the monitor waits for activity.
    Recovered,
    /// Give up and hand the worker to a human or orchestrator.
    Escalate,
}

/// Decides what to do about a silent worker.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Called when a gap is flagged and again, at most every `2T`, while it
    /// stays open. `gap.recovery_attempts` counts earlier calls.
    async fn attempt_recovery(&self, gap: &GapEvent) -> RecoveryOutcome;
}

/// Restarts the worker up to `max_restarts` times (once by default), then
/// escalates.
pub struct DefaultRecovery {
    supervisor: Arc<ProcessSupervisor>,
    max_restarts: u32,
}

impl DefaultRecovery {
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            supervisor,
            max_restarts: 1,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }
}

#[async_trait]
impl RecoveryStrategy for DefaultRecovery {
    async fn attempt_recovery(&self, gap: &GapEvent) -> RecoveryOutcome {
        if gap.recovery_attempts >= self.max_restarts {
            return RecoveryOutcome::Escalate;
        }
        match self.supervisor.restart(&gap.worker_id).await {
            Ok(worker) => {
                info!(worker_id = %worker.id, restart_count = worker.restart_count, "restarted silent worker");
                RecoveryOutcome::Recovered
            }
            Err(e) => {
                warn!(worker_id = %gap.worker_id, error = %e, "restart failed");
                RecoveryOutcome::Escalate
            }
        }
    }
}

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub unresponsive: Vec<WorkerId>,
    pub detected: Vec<GapId>,
    pub resolved: Vec<GapId>,
    pub recovery_attempts: Vec<GapId>,
    pub escalated: Vec<GapId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.unresponsive.is_empty()
            && self.detected.is_empty()
            && self.resolved.is_empty()
            && self.recovery_attempts.is_empty()
            && self.escalated.is_empty()
    }
}

/// Aggregate view of the gap log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub total_gaps: usize,
    pub open: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub acknowledged: usize,
    /// Recovery attempts across all gaps.
    pub recovery_attempts: u32,
    /// Resolved gaps that needed no escalation, as a fraction of resolved ones.
    pub recovery_rate: Option<f64>,
    /// Mean seconds from detection to resolution.
    pub mean_seconds_to_resolve: Option<i64>,
    pub by_worker: BTreeMap<WorkerId, usize>,
}

impl RecoveryStats {
    pub fn from_gaps(gaps: &[GapEvent]) -> Self {
        let mut stats = Self {
            total_gaps: gaps.len(),
            ..Default::default()
        };
        let mut recovered = 0;
        let mut resolve_secs = Vec::new();
        for gap in gaps {
            *stats.by_worker.entry(gap.worker_id.clone()).or_default() += 1;
            stats.recovery_attempts += gap.recovery_attempts;
            if gap.escalated {
                stats.escalated += 1;
            }
            if gap.is_acknowledged() {
                stats.acknowledged += 1;
            }
            if gap.resolved {
                stats.resolved += 1;
                if !gap.escalated {
                    recovered += 1;
                }
                if let Some(at) = gap.resolved_at {
                    resolve_secs.push((at - gap.detected_at).num_seconds());
                }
            } else {
                stats.open += 1;
            }
        }
        if stats.resolved > 0 {
            stats.recovery_rate = Some(recovered as f64 / stats.resolved as f64);
        }
        if !resolve_secs.is_empty() {
            stats.mean_seconds_to_resolve = Some(resolve_secs.iter().sum::<i64>() / resolve_secs.len() as i64);
        }
        stats
    }
}

/// Watches heartbeats, records gaps and drives recovery.
pub struct HealthMonitor {
    supervisor: Arc<ProcessSupervisor>,
    router: Arc<MessageRouter>,
    strategy: Arc<dyn RecoveryStrategy>,
    store: StateStore,
    events: broadcast::Sender<RuntimeEvent>,
    heartbeat_interval: Duration,
    /// All gaps ever seen. The lock also serializes sweeps.
    gaps: Mutex<Vec<GapEvent>>,
}

impl HealthMonitor {
    /// Creates a monitor, loading recorded gaps from `state/gaps.json`.
    pub fn open(
        supervisor: Arc<ProcessSupervisor>,
        router: Arc<MessageRouter>,
        strategy: Arc<dyn RecoveryStrategy>,
        store: StateStore,
        events: broadcast::Sender<RuntimeEvent>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let gaps = store.load_gaps()?;
        Ok(Self {
            supervisor,
            router,
            strategy,
            store,
            events,
            heartbeat_interval,
            gaps: Mutex::new(gaps),
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    /// Locks the gap list after reloading it from disk.
    async fn reloaded(&self) -> Result<MutexGuard<'_, Vec<GapEvent>>> {
        let mut gaps = self.gaps.lock().await;
        *gaps = self.store.load_gaps()?;
        Ok(gaps)
    }

    /// Recorded gaps, oldest first.
    ///
    /// Falls back to the last loaded list if `state/gaps.json` is unreadable.
    pub async fn gaps(&self, open_only: bool) -> Vec<GapEvent> {
        let mut gaps = self.gaps.lock().await;
        match self.store.load_gaps() {
            Ok(loaded) => *gaps = loaded,
            Err(e) => warn!(error = %e, "could not reload gaps"),
        }
        gaps.iter()
            .filter(|g| !open_only || !g.resolved)
            .cloned()
            .collect()
    }

    /// Acknowledges a gap, stopping further automatic recovery for it.
    pub async fn acknowledge(&self, gap_id: &GapId, now: DateTime<Utc>) -> Result<GapEvent> {
        let mut gaps = self.reloaded().await?;
        let gap = gaps
            .iter_mut()
            .find(|g| &g.id == gap_id)
            .ok_or_else(|| OrchestratorError::GapNotFound(gap_id.clone()))?;
        gap.acknowledge(now);
        let gap = gap.clone();
        self.store.save_gaps(&gaps)?;
        info!(gap_id = %gap_id, worker_id = %gap.worker_id, "gap acknowledged");
        Ok(gap)
    }

    /// Counts over every recorded gap.
    pub async fn recovery_stats(&self) -> Result<RecoveryStats> {
        Ok(RecoveryStats::from_gaps(&self.reloaded().await?))
    }

    /// Checks every worker once as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let t = ChronoDuration::from_std(self.heartbeat_interval)
            .map_err(|e| OrchestratorError::Configuration(format!("heartbeat interval: {}", e)))?;
        let mut gaps = self.reloaded().await?;
        let mut report = SweepReport::default();

        match self.router.prune() {
            Ok(0) => {}
            Ok(n) => debug!(workers = n, "pruned routing state of removed workers"),
            Err(e) => warn!(error = %e, "could not prune routing state"),
        }

        for worker in self.supervisor.workers()? {
            if matches!(worker.state, WorkerState::Stopped | WorkerState::Starting) {
                continue;
            }
            if let Err(e) = self.check_worker(&worker, now, t, &mut gaps, &mut report).await {
                // One bad worker must not stop the sweep.
                error!(worker_id = %worker.id, error = %e, "health check failed");
            }
        }

        if !report.is_empty() {
            self.store.save_gaps(&gaps)?;
            debug!(
                unresponsive = report.unresponsive.len(),
                detected = report.detected.len(),
                resolved = report.resolved.len(),
                escalated = report.escalated.len(),
                "health sweep"
            );
        }
        Ok(report)
    }

    async fn check_worker(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
        t: ChronoDuration,
        gaps: &mut Vec<GapEvent>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let open = gaps.iter().position(|g| g.worker_id == worker.id && !g.resolved);

        if let Some(i) = open {
            let gap = &mut gaps[i];
            if worker.state == WorkerState::Running && worker.last_heartbeat > gap.detected_at {
                gap.resolve(now);
                info!(gap_id = %gap.id, worker_id = %worker.id, "gap resolved");
                report.resolved.push(gap.id.clone());
                self.emit(RuntimeEvent::GapResolved {
                    gap_id: gap.id.clone(),
                    worker_id: worker.id.clone(),
                });
                if let Err(e) = self.router.redeliver(&worker.id).await {
                    warn!(worker_id = %worker.id, error = %e, "redelivery after recovery failed");
                }
                return Ok(());
            }
        }

        let silence = now - worker.last_heartbeat;
        if silence <= t {
            return Ok(());
        }
        if worker.state == WorkerState::Running && self.supervisor.mark_unresponsive(&worker.id)? {
            info!(worker_id = %worker.id, silent_secs = silence.num_seconds(), "worker unresponsive");
            report.unresponsive.push(worker.id.clone());
        }
        if silence <= t * 2 {
            return Ok(());
        }

        let index = match open {
            Some(i) => {
                let gap = &gaps[i];
                let due = gap.last_recovery_at.map_or(true, |at| now - at > t * 2);
                if gap.escalated || gap.is_acknowledged() || !due {
                    return Ok(());
                }
                i
            }
            None => {
                let gap = GapEvent::new(worker.id.clone(), now, silence.num_seconds());
                warn!(
                    gap_id = %gap.id,
                    worker_id = %worker.id,
                    silent_secs = gap.duration_seconds,
                    "gap detected"
                );
                report.detected.push(gap.id.clone());
                self.emit(RuntimeEvent::GapDetected {
                    gap_id: gap.id.clone(),
                    worker_id: worker.id.clone(),
                    duration_seconds: gap.duration_seconds,
                });
                gaps.push(gap);
                gaps.len() - 1
            }
        };
        self.recover(&mut gaps[index], now, report).await;
        Ok(())
    }

    async fn recover(&self, gap: &mut GapEvent, now: DateTime<Utc>, report: &mut SweepReport) {
        let outcome = self.strategy.attempt_recovery(gap).await;
        gap.record_attempt(now);
        report.recovery_attempts.push(gap.id.clone());

        if outcome == RecoveryOutcome::Escalate {
            gap.escalated = true;
            report.escalated.push(gap.id.clone());
            self.escalate(gap).await;
        }
    }

    /// Notifies orchestrator workers and human channels about a gap.
    async fn escalate(&self, gap: &GapEvent) {
        let reason = format!(
            "worker {} silent for {}s after {} recovery attempt(s)",
            gap.worker_id, gap.duration_seconds, gap.recovery_attempts
        );
        warn!(gap_id = %gap.id, worker_id = %gap.worker_id, "escalating gap");

        let orchestrators = match self.supervisor.active_with_role(Role::Orchestrator) {
            Ok(workers) => workers,
            Err(e) => {
                warn!(error = %e, "could not list orchestrators");
                Vec::new()
            }
        };
        for orchestrator in orchestrators.into_iter().filter(|o| o.id != gap.worker_id) {
            let message = Message::escalation(
                Address::external(HEALTH_MONITOR_SENDER),
                orchestrator.id.clone(),
                format!("{} (gap {})", reason, gap.id),
            )
            .with_priority(Priority::Urgent);
            if let Err(e) = self.router.send(message).await {
                warn!(worker_id = %orchestrator.id, error = %e, "escalation not delivered");
            }
        }

        self.emit(RuntimeEvent::Escalated {
            gap_id: gap.id.clone(),
            worker_id: gap.worker_id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use orchestrator_conversation::{Budget, ConversationStore, ExtractiveSummarizer};
    use orchestrator_models::MessageKind;
    use orchestrator_persistence::AuditLog;
    use orchestrator_tmux::MemoryBackend;
    use tempfile::{tempdir, TempDir};

    use crate::backend::TimedBackend;
    use crate::supervisor::SpawnOptions;

    const T: i64 = 60;

    struct Fixture {
        dir: TempDir,
        supervisor: Arc<ProcessSupervisor>,
        conversations: Arc<ConversationStore>,
        router: Arc<MessageRouter>,
        events: broadcast::Sender<RuntimeEvent>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let (tx, _) = broadcast::channel(256);
        let backend = TimedBackend::new(memory, Duration::from_secs(1));
        let supervisor = Arc::new(
            ProcessSupervisor::open(backend, StateStore::new(dir.path()), HashMap::new(), tx.clone()).unwrap(),
        );
        let conversations = Arc::new(ConversationStore::in_memory(
            Budget::default(),
            Arc::new(ExtractiveSummarizer),
        ));
        let router = Arc::new(MessageRouter::new(
            supervisor.clone(),
            conversations.clone(),
            AuditLog::new(dir.path()),
            tx.clone(),
            4096,
        ));
        Fixture {
            dir,
            supervisor,
            conversations,
            router,
            events: tx,
        }
    }

    fn monitor(f: &Fixture, strategy: Arc<dyn RecoveryStrategy>) -> HealthMonitor {
        HealthMonitor::open(
            f.supervisor.clone(),
            f.router.clone(),
            strategy,
            StateStore::new(f.dir.path()),
            f.events.clone(),
            Duration::from_secs(T as u64),
        )
        .unwrap()
    }

    fn default_monitor(f: &Fixture) -> HealthMonitor {
        monitor(f, Arc::new(DefaultRecovery::new(f.supervisor.clone())))
    }

    fn secs(s: i64) -> ChronoDuration {
        ChronoDuration::seconds(s)
    }

    /// Counts calls and always reports success.
    struct CountingRecovery(AtomicUsize);

    #[async_trait]
    impl RecoveryStrategy for CountingRecovery {
        async fn attempt_recovery(&self, _gap: &GapEvent) -> RecoveryOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            RecoveryOutcome::Recovered
        }
    }

    #[tokio::test]
    async fn test_silence_marks_unresponsive_then_activity_revives() {
        let f = fixture();
        let health = default_monitor(&f);
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = w.last_heartbeat;

        let report = health.sweep(start + secs(T / 2)).await.unwrap();
        assert!(report.is_empty());

        let report = health.sweep(start + secs(T + 1)).await.unwrap();
        assert_eq!(report.unresponsive, vec![w.id.clone()]);
        assert!(report.detected.is_empty());
        assert_eq!(f.supervisor.get(&w.id).unwrap().state, WorkerState::Unresponsive);

        f.supervisor.record_activity(&w.id, start + secs(T + 5)).unwrap();
        assert_eq!(f.supervisor.get(&w.id).unwrap().state, WorkerState::Running);
        assert!(health.gaps(false).await.is_empty());
    }

    #[tokio::test]
    async fn test_gap_restart_then_resolve() {
        let f = fixture();
        let health = default_monitor(&f);
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = w.last_heartbeat;

        let report = health.sweep(start + secs(2 * T + 1)).await.unwrap();
        assert_eq!(report.detected.len(), 1);
        assert_eq!(report.recovery_attempts.len(), 1);
        assert!(report.escalated.is_empty());

        let gaps = health.gaps(true).await;
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].worker_id, w.id);
        assert!(!gaps[0].resolved);
        assert_eq!(gaps[0].recovery_attempts, 1);
        assert_eq!(f.supervisor.get(&w.id).unwrap().restart_count, 1);

        f.supervisor.record_activity(&w.id, start + secs(2 * T + 10)).unwrap();
        let report = health.sweep(start + secs(2 * T + 11)).await.unwrap();
        assert_eq!(report.resolved, vec![gaps[0].id.clone()]);

        let all = health.gaps(false).await;
        assert!(all[0].resolved);
        assert!(health.gaps(true).await.is_empty());
        assert_eq!(f.supervisor.get(&w.id).unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn test_still_silent_after_restart_escalates_once() {
        let f = fixture();
        let health = default_monitor(&f);
        let orch = f.supervisor.spawn(Role::Orchestrator, "proj", SpawnOptions::default()).await.unwrap();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = w.last_heartbeat;

        let mut at = start + secs(2 * T + 1);
        f.supervisor.record_activity(&orch.id, at).unwrap();
        health.sweep(at).await.unwrap();

        // not yet due for another attempt
        at = at + secs(T);
        f.supervisor.record_activity(&orch.id, at).unwrap();
        let report = health.sweep(at).await.unwrap();
        assert!(report.recovery_attempts.is_empty());

        at = start + secs(4 * T + 2) + secs(1);
        f.supervisor.record_activity(&orch.id, at).unwrap();
        let report = health.sweep(at).await.unwrap();
        assert_eq!(report.escalated.len(), 1);

        let gap = &health.gaps(true).await[0];
        assert!(gap.escalated);
        assert_eq!(gap.recovery_attempts, 2);
        assert_eq!(f.supervisor.get(&w.id).unwrap().restart_count, 1);

        let inbox = f.conversations.history(&orch.id, None).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, MessageKind::Escalation);
        assert_eq!(inbox[0].priority, Priority::Urgent);
        assert_eq!(inbox[0].from, Address::external(HEALTH_MONITOR_SENDER));
        assert!(inbox[0].body.contains(w.id.as_str()));

        // escalated gaps are left alone
        at = at + secs(10 * T);
        f.supervisor.record_activity(&orch.id, at).unwrap();
        let report = health.sweep(at).await.unwrap();
        assert!(report.recovery_attempts.is_empty());
        assert_eq!(f.conversations.history(&orch.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_waits_two_intervals() {
        let f = fixture();
        let strategy = Arc::new(CountingRecovery(AtomicUsize::new(0)));
        let health = monitor(&f, strategy.clone());
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = w.last_heartbeat;

        health.sweep(start + secs(2 * T + 1)).await.unwrap();
        health.sweep(start + secs(3 * T)).await.unwrap();
        health.sweep(start + secs(4 * T + 1)).await.unwrap();
        assert_eq!(strategy.0.load(Ordering::SeqCst), 1);

        health.sweep(start + secs(4 * T + 2)).await.unwrap();
        assert_eq!(strategy.0.load(Ordering::SeqCst), 2);
        assert_eq!(health.gaps(true).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_workers_are_ignored() {
        let f = fixture();
        let health = default_monitor(&f);
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        f.supervisor.terminate(&w.id).await.unwrap();

        let report = health.sweep(w.last_heartbeat + secs(10 * T)).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_gaps_survive_reopen() {
        let f = fixture();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        {
            let health = default_monitor(&f);
            health.sweep(w.last_heartbeat + secs(2 * T + 1)).await.unwrap();
        }
        let health = default_monitor(&f);
        let gaps = health.gaps(false).await;
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].worker_id, w.id);
    }

    #[tokio::test]
    async fn test_restart_limit_is_configurable() {
        let f = fixture();
        let strategy = DefaultRecovery::new(f.supervisor.clone()).with_max_restarts(2);
        let health = monitor(&f, Arc::new(strategy));
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = w.last_heartbeat;

        health.sweep(start + secs(2 * T + 1)).await.unwrap();
        let report = health.sweep(start + secs(4 * T + 2)).await.unwrap();
        assert!(report.escalated.is_empty());
        assert_eq!(f.supervisor.get(&w.id).unwrap().restart_count, 2);

        let report = health.sweep(start + secs(6 * T + 3)).await.unwrap();
        assert_eq!(report.escalated.len(), 1);
        assert_eq!(f.supervisor.get(&w.id).unwrap().restart_count, 2);
    }

    #[tokio::test]
    async fn test_acknowledged_gap_gets_no_more_recovery() {
        let f = fixture();
        let health = default_monitor(&f);
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = w.last_heartbeat;

        health.sweep(start + secs(2 * T + 1)).await.unwrap();
        let gap_id = health.gaps(true).await[0].id.clone();

        // acknowledged through a second monitor on the same state directory
        let other = default_monitor(&f);
        let acked = other.acknowledge(&gap_id, start + secs(2 * T + 5)).await.unwrap();
        assert!(acked.is_acknowledged());
        assert!(matches!(
            other.acknowledge(&GapId::from("gap-missing"), start).await,
            Err(OrchestratorError::GapNotFound(_))
        ));

        let report = health.sweep(start + secs(4 * T + 3)).await.unwrap();
        assert!(report.recovery_attempts.is_empty());
        assert!(report.escalated.is_empty());
        let gap = &health.gaps(true).await[0];
        assert!(gap.is_acknowledged());
        assert!(!gap.resolved);

        // still resolves on activity
        f.supervisor.record_activity(&w.id, start + secs(4 * T + 10)).unwrap();
        let report = health.sweep(start + secs(4 * T + 11)).await.unwrap();
        assert_eq!(report.resolved, vec![gap_id]);
    }

    #[tokio::test]
    async fn test_recovery_stats() {
        let f = fixture();
        let health = default_monitor(&f);
        let a = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let b = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let start = a.last_heartbeat.max(b.last_heartbeat);

        health.sweep(start + secs(2 * T + 1)).await.unwrap();
        f.supervisor.record_activity(&a.id, start + secs(2 * T + 31)).unwrap();
        health.sweep(start + secs(2 * T + 31)).await.unwrap();

        let stats = health.recovery_stats().await.unwrap();
        assert_eq!(stats.total_gaps, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.escalated, 0);
        assert_eq!(stats.recovery_attempts, 2);
        assert_eq!(stats.recovery_rate, Some(1.0));
        assert_eq!(stats.mean_seconds_to_resolve, Some(30));
        assert_eq!(stats.by_worker.get(&a.id), Some(&1));
        assert_eq!(stats.by_worker.get(&b.id), Some(&1));
    }
}
