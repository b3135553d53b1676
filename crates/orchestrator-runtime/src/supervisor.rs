//! ProcessSupervisor - owns the worker table and every worker lifecycle.
//!
//! # Concurrency
//!
//! - The table (`sessions` + `workers`) sits behind a std `Mutex` that is
//!   never held across a backend call.
//! - `state/workers.json` is the source of truth: the table is reloaded
//!   before every query and mutation, so a CLI invocation and a running
//!   daemon see each other's workers. Heartbeats only held in memory are
//!   merged by keeping the later one.
//! - Lifecycle operations (spawn, restart, terminate, archive, session
//!   create/kill, reconcile) are serialized by one tokio `Mutex`, so two
//!   restarts of the same worker cannot interleave while lookups from the
//!   router and health monitor proceed.
//!
//! Every state transition rewrites `state/workers.json` atomically; plain
//! heartbeats are flushed at most once per `heartbeat_flush` per worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator_models::{Role, Session, SessionStatus, Window, Worker, WorkerId, WorkerState};
use orchestrator_persistence::{StateStore, WorkerTable};
use orchestrator_tmux::{validate_name, BackendSession};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::backend::TimedBackend;
use crate::error::{OrchestratorError, Result};
use crate::event::RuntimeEvent;

/// Key sequence sent before relaunching a worker in place.
const INTERRUPT_KEYS: &str = "C-c";

/// Default minimum gap between persisted heartbeats of one worker.
pub const DEFAULT_HEARTBEAT_FLUSH: Duration = Duration::from_secs(30);

/// Optional parameters for [`ProcessSupervisor::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Manager the new worker reports to (executors only).
    pub manager: Option<WorkerId>,
    /// Overrides the per-role launch command.
    pub launch_command: Option<String>,
}

/// Outcome of [`ProcessSupervisor::reconcile`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Workers whose window or session disappeared.
    pub stopped_workers: Vec<WorkerId>,
    /// Sessions no longer present in the backend.
    pub terminated_sessions: Vec<String>,
}

#[derive(Debug, Default)]
struct Table {
    sessions: BTreeMap<String, Session>,
    workers: BTreeMap<WorkerId, Worker>,
}

impl Table {
    fn from_snapshot(snapshot: WorkerTable) -> Self {
        Self {
            sessions: snapshot
                .sessions
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            workers: snapshot
                .workers
                .into_iter()
                .map(|w| (w.id.clone(), w))
                .collect(),
        }
    }

    /// Replaces the table with the persisted one, keeping newer in-memory heartbeats.
    fn adopt(&mut self, persisted: WorkerTable) {
        let mut fresh = Self::from_snapshot(persisted);
        for (id, worker) in fresh.workers.iter_mut() {
            if let Some(mine) = self.workers.get(id) {
                worker.last_heartbeat = worker.last_heartbeat.max(mine.last_heartbeat);
            }
        }
        *self = fresh;
    }

    fn snapshot(&self) -> WorkerTable {
        WorkerTable {
            sessions: self.sessions.values().cloned().collect(),
            workers: self.workers.values().cloned().collect(),
        }
    }

    fn live_session(&self, name: &str) -> Option<&Session> {
        self.sessions.get(name).filter(|s| s.is_alive())
    }

    /// Clears a window's claim so the next spawn can reuse it.
    fn free_window(&mut self, session: &str, index: u32, worker_id: &WorkerId) {
        if let Some(window) = self.sessions.get_mut(session).and_then(|s| s.window_mut(index)) {
            if window.worker_id.as_ref() == Some(worker_id) {
                window.worker_id = None;
            }
        }
    }

    fn release_window(&mut self, session: &str, index: u32, worker_id: &WorkerId) {
        if let Some(session) = self.sessions.get_mut(session) {
            if session
                .window(index)
                .is_some_and(|w| w.worker_id.as_ref() == Some(worker_id))
            {
                session.remove_window(index);
            }
        }
    }
}

/// Owns sessions, windows and workers.
pub struct ProcessSupervisor {
    backend: TimedBackend,
    store: StateStore,
    launch_commands: HashMap<Role, String>,
    heartbeat_flush: Duration,
    table: StdMutex<Table>,
    lifecycle: Mutex<()>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl ProcessSupervisor {
    /// Creates a supervisor, loading the persisted worker table.
    pub fn open(
        backend: TimedBackend,
        store: StateStore,
        launch_commands: HashMap<Role, String>,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> Result<Self> {
        let table = Table::from_snapshot(store.load_worker_table()?);
        debug!(
            sessions = table.sessions.len(),
            workers = table.workers.len(),
            "loaded worker table"
        );
        Ok(Self {
            backend,
            store,
            launch_commands,
            heartbeat_flush: DEFAULT_HEARTBEAT_FLUSH,
            table: StdMutex::new(table),
            lifecycle: Mutex::new(()),
            events,
        })
    }

    /// Sets how often plain heartbeats are written to disk.
    pub fn with_heartbeat_flush(mut self, every: Duration) -> Self {
        self.heartbeat_flush = every;
        self
    }

    pub fn backend(&self) -> &TimedBackend {
        &self.backend
    }

    fn emit(&self, event: RuntimeEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Locks the table after reloading it from disk.
    fn refreshed(&self) -> Result<MutexGuard<'_, Table>> {
        let mut table = self
            .table
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?;
        table.adopt(self.store.load_worker_table()?);
        Ok(table)
    }

    fn read<T>(&self, f: impl FnOnce(&Table) -> T) -> Result<T> {
        let table = self.refreshed()?;
        Ok(f(&table))
    }

    /// Mutates the table and persists the result before releasing the lock.
    fn write<T>(&self, f: impl FnOnce(&mut Table) -> Result<T>) -> Result<T> {
        let mut table = self.refreshed()?;
        let value = f(&mut table)?;
        self.store.save_worker_table(&table.snapshot())?;
        Ok(value)
    }

    /// Writes the current table to disk.
    pub fn checkpoint(&self) -> Result<()> {
        self.write(|_| Ok(()))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, worker_id: &WorkerId) -> Result<Worker> {
        self.read(|t| t.workers.get(worker_id).cloned())?
            .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.clone()))
    }

    pub fn contains(&self, worker_id: &WorkerId) -> Result<bool> {
        self.read(|t| t.workers.contains_key(worker_id))
    }

    /// All workers, oldest first.
    pub fn workers(&self) -> Result<Vec<Worker>> {
        let mut workers = self.read(|t| t.workers.values().cloned().collect::<Vec<_>>())?;
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(workers)
    }

    /// Workers with the given role that are not stopped.
    pub fn active_with_role(&self, role: Role) -> Result<Vec<Worker>> {
        Ok(self
            .workers()?
            .into_iter()
            .filter(|w| w.role == role && w.state != WorkerState::Stopped)
            .collect())
    }

    pub fn sessions(&self) -> Result<Vec<Session>> {
        self.read(|t| t.sessions.values().cloned().collect())
    }

    pub fn session(&self, name: &str) -> Result<Session> {
        self.read(|t| t.sessions.get(name).cloned())?
            .ok_or_else(|| OrchestratorError::SessionNotFound(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Creates a session, or returns it unchanged if it is already managed.
    ///
    /// Fails with `SessionExists` when the backend already has a session of
    /// that name that this supervisor does not manage.
    pub async fn create_session(&self, name: &str) -> Result<Session> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_session(name).await
    }

    async fn ensure_session(&self, name: &str) -> Result<Session> {
        validate_name(name)?;
        if let Some(existing) = self.read(|t| t.live_session(name).cloned())? {
            return Ok(existing);
        }
        if self.backend.session_exists(name).await? {
            return Err(OrchestratorError::SessionExists(name.to_string()));
        }

        let created = self.backend.create_session(name).await?;
        let session = session_from_backend(&created);
        info!(session = %name, windows = session.windows.len(), "session created");

        self.write(|t| {
            t.sessions.insert(name.to_string(), session.clone());
            Ok(())
        })?;
        Ok(session)
    }

    /// Kills a session and removes every worker it hosted.
    pub async fn kill_session(&self, name: &str) -> Result<Vec<WorkerId>> {
        let _guard = self.lifecycle.lock().await;

        let known = self.read(|t| t.sessions.contains_key(name))?;
        if !known && !self.backend.session_exists(name).await? {
            return Err(OrchestratorError::SessionNotFound(name.to_string()));
        }
        self.backend.kill_session(name).await?;

        let removed = self.write(|t| {
            if let Some(session) = t.sessions.get_mut(name) {
                session.status = SessionStatus::Terminated;
                session.windows.clear();
            }
            let ids: Vec<WorkerId> = t
                .workers
                .values()
                .filter(|w| w.session == name)
                .map(|w| w.id.clone())
                .collect();
            for id in &ids {
                t.workers.remove(id);
            }
            Ok(ids)
        })?;

        info!(session = %name, workers = removed.len(), "session killed");
        for worker_id in &removed {
            self.emit(RuntimeEvent::WorkerTerminated {
                worker_id: worker_id.clone(),
            });
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Starts a new worker in `session_hint`, creating the session if needed.
    ///
    /// The first free window is reused, otherwise a window titled after the
    /// worker id is created. The worker is `Starting` until the backend
    /// confirms its window, then `Running`. Backend failures surface as
    /// `SpawnFailed`; nothing is retried here.
    pub async fn spawn(&self, role: Role, session_hint: &str, options: SpawnOptions) -> Result<Worker> {
        let _guard = self.lifecycle.lock().await;

        if let Some(manager_id) = &options.manager {
            let manager = self.get(manager_id)?;
            if manager.role != Role::Manager {
                return Err(OrchestratorError::InvalidState(format!(
                    "{} is a {}, not a manager",
                    manager_id, manager.role
                )));
            }
        }

        let session = self.ensure_session(session_hint).await.map_err(spawn_error)?;

        let launch_command = options
            .launch_command
            .or_else(|| self.launch_commands.get(&role).cloned());
        let mut worker = Worker::new(role, &session.id, 0)
            .with_manager(options.manager)
            .with_launch_command(launch_command);
        let title = worker.id.to_string();

        let index = match session.free_window() {
            Some(free) => {
                self.backend
                    .rename_window(&session.id, free.index, &title)
                    .await
                    .map_err(spawn_error)?;
                free.index
            }
            None => {
                self.backend
                    .create_window(&session.id, &title)
                    .await
                    .map_err(spawn_error)?
                    .index
            }
        };
        worker.window = index;

        self.write(|t| {
            let mut window = Window::new(index, title.clone());
            window.worker_id = Some(worker.id.clone());
            if let Some(s) = t.sessions.get_mut(&session.id) {
                s.upsert_window(window);
            }
            t.workers.insert(worker.id.clone(), worker.clone());
            Ok(())
        })?;

        info!(worker_id = %worker.id, role = %role, target = %worker.target(), "worker spawned");
        self.emit(RuntimeEvent::WorkerSpawned {
            worker_id: worker.id.clone(),
            session: session.id.clone(),
            window: index,
        });

        if let Err(e) = self.launch(&worker.id).await {
            self.write(|t| {
                t.free_window(&session.id, index, &worker.id);
                t.workers.remove(&worker.id);
                Ok(())
            })?;
            return Err(e);
        }
        self.get(&worker.id)
    }

    /// Types the launch command (if any), confirms the window and marks the
    /// worker `Running`. On failure the worker is marked `Stopped`.
    async fn launch(&self, worker_id: &WorkerId) -> Result<()> {
        let worker = self.get(worker_id)?;

        let result = async {
            if let Some(command) = &worker.launch_command {
                self.backend
                    .send_input(&worker.session, worker.window, command)
                    .await?;
            }
            if !self.backend.has_window(&worker.session, worker.window).await? {
                return Err(OrchestratorError::TargetNotFound(worker.target()));
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.transition(worker_id, WorkerState::Running, Some(Utc::now()))?;
                Ok(())
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "worker failed to start");
                self.transition(worker_id, WorkerState::Stopped, None)?;
                Err(spawn_error(e))
            }
        }
    }

    /// Sets a worker's state, persisting and emitting on change.
    ///
    /// `started_at` is updated when given.
    fn transition(&self, worker_id: &WorkerId, to: WorkerState, started_at: Option<DateTime<Utc>>) -> Result<()> {
        let from = self.write(|t| {
            let worker = t
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.clone()))?;
            let from = worker.state;
            worker.state = to;
            if let Some(at) = started_at {
                worker.started_at = at;
            }
            Ok(from)
        })?;

        if from != to {
            debug!(worker_id = %worker_id, from = %from, to = %to, "worker state changed");
            self.emit(RuntimeEvent::WorkerStateChanged {
                worker_id: worker_id.clone(),
                from,
                to,
            });
        }
        Ok(())
    }

    /// Records observed activity: bumps `last_heartbeat` and revives an
    /// unresponsive worker.
    ///
    /// The table is written when the worker revives or when the persisted
    /// heartbeat is at least `heartbeat_flush` old.
    pub fn record_activity(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        let revived = {
            let mut table = self
                .table
                .lock()
                .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?;
            let persisted = self.store.load_worker_table()?;
            let flushed_at = persisted
                .workers
                .iter()
                .find(|w| &w.id == worker_id)
                .map(|w| w.last_heartbeat);
            table.adopt(persisted);

            let worker = table
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.clone()))?;
            if now > worker.last_heartbeat {
                worker.last_heartbeat = now;
            }
            let revived = worker.state == WorkerState::Unresponsive;
            if revived {
                worker.state = WorkerState::Running;
            }
            let stale = flushed_at.map_or(true, |at| {
                (worker.last_heartbeat - at)
                    .to_std()
                    .is_ok_and(|age| age >= self.heartbeat_flush)
            });
            if revived || stale {
                self.store.save_worker_table(&table.snapshot())?;
            }
            revived
        };

        if revived {
            info!(worker_id = %worker_id, "worker responsive again");
            self.emit(RuntimeEvent::WorkerStateChanged {
                worker_id: worker_id.clone(),
                from: WorkerState::Unresponsive,
                to: WorkerState::Running,
            });
        }
        Ok(())
    }

    /// Marks a running worker unresponsive. Other states are left alone.
    ///
    /// Returns true if the state changed.
    pub fn mark_unresponsive(&self, worker_id: &WorkerId) -> Result<bool> {
        if self.get(worker_id)?.state != WorkerState::Running {
            return Ok(false);
        }
        self.transition(worker_id, WorkerState::Unresponsive, None)?;
        Ok(true)
    }

    /// Restarts a worker in place, keeping its id.
    ///
    /// `restart_count` is incremented before anything else so the audit
    /// trail records attempts that fail. If the window is gone, a new one
    /// with the same title is created (and the session too, if needed).
    /// A restart is not a heartbeat.
    pub async fn restart(&self, worker_id: &WorkerId) -> Result<Worker> {
        let _guard = self.lifecycle.lock().await;

        let (worker, from) = self.write(|t| {
            let worker = t
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.clone()))?;
            let from = worker.state;
            worker.restart_count += 1;
            worker.state = WorkerState::Starting;
            Ok((worker.clone(), from))
        })?;

        info!(worker_id = %worker_id, restart_count = worker.restart_count, "restarting worker");
        self.emit(RuntimeEvent::WorkerRestarted {
            worker_id: worker_id.clone(),
            restart_count: worker.restart_count,
        });
        if from != WorkerState::Starting {
            self.emit(RuntimeEvent::WorkerStateChanged {
                worker_id: worker_id.clone(),
                from,
                to: WorkerState::Starting,
            });
        }

        if let Err(e) = self.reopen_window(&worker).await {
            warn!(worker_id = %worker_id, error = %e, "restart could not reopen window");
            self.transition(worker_id, WorkerState::Stopped, None)?;
            return Err(spawn_error(e));
        }

        self.launch(worker_id).await?;
        self.get(worker_id)
    }

    /// Interrupts the existing window, or recreates it when it vanished.
    async fn reopen_window(&self, worker: &Worker) -> Result<()> {
        let window_alive = match self.backend.has_window(&worker.session, worker.window).await {
            Ok(alive) => alive,
            Err(OrchestratorError::SessionNotFound(_)) => false,
            Err(e) => return Err(e),
        };

        if window_alive {
            return self
                .backend
                .send_keys(&worker.session, worker.window, INTERRUPT_KEYS)
                .await;
        }

        debug!(worker_id = %worker.id, target = %worker.target(), "window gone, recreating");
        let created = self.backend.create_session(&worker.session).await?;
        let title = worker.id.to_string();
        let index = self.backend.create_window(&worker.session, &title).await?.index;

        self.write(|t| {
            let session = t
                .sessions
                .entry(worker.session.clone())
                .or_insert_with(|| session_from_backend(&created));
            session.status = status_of(&created);
            session.remove_window(worker.window);
            let mut window = Window::new(index, title.clone());
            window.worker_id = Some(worker.id.clone());
            session.upsert_window(window);
            if let Some(w) = t.workers.get_mut(&worker.id) {
                w.window = index;
            }
            Ok(())
        })
    }

    /// Stops a worker and releases its window. The session stays.
    ///
    /// Terminating a stopped worker is a no-op.
    pub async fn terminate(&self, worker_id: &WorkerId) -> Result<Worker> {
        let _guard = self.lifecycle.lock().await;
        self.terminate_locked(worker_id).await
    }

    async fn terminate_locked(&self, worker_id: &WorkerId) -> Result<Worker> {
        let worker = self.get(worker_id)?;
        if worker.state == WorkerState::Stopped {
            return Ok(worker);
        }

        self.backend.kill_window(&worker.session, worker.window).await?;

        self.write(|t| {
            t.release_window(&worker.session, worker.window, worker_id);
            Ok(())
        })?;
        self.transition(worker_id, WorkerState::Stopped, None)?;

        info!(worker_id = %worker_id, "worker terminated");
        self.emit(RuntimeEvent::WorkerTerminated {
            worker_id: worker_id.clone(),
        });
        self.get(worker_id)
    }

    /// Terminates a worker if needed and removes it from the table.
    ///
    /// Its conversation log stays on disk.
    pub async fn archive(&self, worker_id: &WorkerId) -> Result<Worker> {
        let _guard = self.lifecycle.lock().await;
        self.terminate_locked(worker_id).await?;

        let archived = self.write(|t| {
            t.workers
                .remove(worker_id)
                .ok_or_else(|| OrchestratorError::WorkerNotFound(worker_id.clone()))
        })?;
        info!(worker_id = %worker_id, restarts = archived.restart_count, "worker archived");
        Ok(archived)
    }

    /// Brings the table in line with what the backend reports.
    ///
    /// Sessions missing from the backend become `Terminated`; workers whose
    /// session or window vanished become `Stopped`.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lifecycle.lock().await;
        let live: HashMap<String, BackendSession> = self
            .backend
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        let (report, changed) = self.write(|t| {
            let mut report = ReconcileReport::default();
            let mut changed = Vec::new();

            for (name, session) in t.sessions.iter_mut() {
                if !session.is_alive() {
                    continue;
                }
                match live.get(name) {
                    None => {
                        session.status = SessionStatus::Terminated;
                        session.windows.clear();
                        report.terminated_sessions.push(name.clone());
                    }
                    Some(backend) => {
                        session.status = status_of(backend);
                        session.windows.retain(|w| backend.window(w.index).is_some());
                    }
                }
            }

            for worker in t.workers.values_mut() {
                if worker.state == WorkerState::Stopped {
                    continue;
                }
                let present = live
                    .get(&worker.session)
                    .is_some_and(|s| s.window(worker.window).is_some());
                if !present {
                    changed.push((worker.id.clone(), worker.state));
                    worker.state = WorkerState::Stopped;
                    report.stopped_workers.push(worker.id.clone());
                }
            }
            Ok((report, changed))
        })?;

        for (worker_id, from) in changed {
            warn!(worker_id = %worker_id, "orphaned worker stopped");
            self.emit(RuntimeEvent::WorkerStateChanged {
                worker_id,
                from,
                to: WorkerState::Stopped,
            });
        }
        Ok(report)
    }
}

fn status_of(session: &BackendSession) -> SessionStatus {
    if session.attached {
        SessionStatus::Active
    } else {
        SessionStatus::Detached
    }
}

fn session_from_backend(backend: &BackendSession) -> Session {
    let mut session = Session::new(backend.name.clone(), backend.created_at);
    session.status = status_of(backend);
    for w in &backend.windows {
        session.upsert_window(Window::new(w.index, w.title.clone()));
    }
    session
}

/// Wraps backend failures during spawn; `SessionExists` keeps its own type.
fn spawn_error(err: OrchestratorError) -> OrchestratorError {
    match err {
        OrchestratorError::SessionExists(_)
        | OrchestratorError::SpawnFailed(_)
        | OrchestratorError::LockPoisoned(_)
        | OrchestratorError::Persistence(_) => err,
        other => OrchestratorError::SpawnFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use orchestrator_tmux::{MemoryBackend, SessionBackend};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        memory: Arc<MemoryBackend>,
        supervisor: ProcessSupervisor,
        events: broadcast::Receiver<RuntimeEvent>,
    }

    fn fixture() -> Fixture {
        fixture_with(HashMap::new())
    }

    fn fixture_with(launch: HashMap<Role, String>) -> Fixture {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let backend = TimedBackend::new(memory.clone(), Duration::from_secs(1));
        let (tx, rx) = broadcast::channel(64);
        let supervisor = ProcessSupervisor::open(backend, StateStore::new(dir.path()), launch, tx).unwrap();
        Fixture {
            _dir: dir,
            memory,
            supervisor,
            events: rx,
        }
    }

    #[tokio::test]
    async fn test_spawn_reuses_first_window_then_creates() {
        let f = fixture();

        let first = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let second = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();

        assert_eq!(first.window, 0);
        assert_eq!(second.window, 1);
        assert_eq!(first.state, WorkerState::Running);
        assert_eq!(first.restart_count, 0);

        let session = f.supervisor.session("proj").unwrap();
        assert_eq!(session.window(0).unwrap().worker_id.as_ref(), Some(&first.id));
        assert_eq!(session.window(0).unwrap().title, first.id.as_str());
        assert_eq!(session.window(1).unwrap().worker_id.as_ref(), Some(&second.id));
    }

    #[tokio::test]
    async fn test_spawn_sends_launch_command() {
        let mut launch = HashMap::new();
        launch.insert(Role::Executor, "claude".to_string());
        let f = fixture_with(launch);

        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let m = f
            .supervisor
            .spawn(
                Role::Manager,
                "proj",
                SpawnOptions {
                    launch_command: Some("aider".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(f.memory.sent_input("proj", w.window), vec!["claude".to_string()]);
        assert_eq!(f.memory.sent_input("proj", m.window), vec!["aider".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_spawn_failed() {
        let f = fixture();
        f.memory.set_unavailable(true);

        let result = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await;
        assert!(matches!(result, Err(OrchestratorError::SpawnFailed(_))));
        assert!(f.supervisor.workers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_rejects_non_manager_manager() {
        let f = fixture();
        let exec = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();

        let result = f
            .supervisor
            .spawn(
                Role::Executor,
                "proj",
                SpawnOptions {
                    manager: Some(exec.id.clone()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_create_session_idempotent_and_foreign() {
        let f = fixture();

        let a = f.supervisor.create_session("proj").await.unwrap();
        let b = f.supervisor.create_session("proj").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(f.memory.list_sessions().unwrap().len(), 1);

        f.memory.create_session("foreign").unwrap();
        let result = f.supervisor.create_session("foreign").await;
        assert!(matches!(result, Err(OrchestratorError::SessionExists(n)) if n == "foreign"));

        let result = f.supervisor.create_session("bad:name").await;
        assert!(matches!(result, Err(OrchestratorError::Backend(_))));
    }

    #[tokio::test]
    async fn test_record_activity_revives_unresponsive() {
        let mut f = fixture();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        while f.events.try_recv().is_ok() {}

        assert!(f.supervisor.mark_unresponsive(&w.id).unwrap());
        assert!(!f.supervisor.mark_unresponsive(&w.id).unwrap());

        let later = Utc::now() + chrono::Duration::seconds(30);
        f.supervisor.record_activity(&w.id, later).unwrap();

        let w = f.supervisor.get(&w.id).unwrap();
        assert_eq!(w.state, WorkerState::Running);
        assert_eq!(w.last_heartbeat, later);

        let mut transitions = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            if let RuntimeEvent::WorkerStateChanged { from, to, .. } = event {
                transitions.push((from, to));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (WorkerState::Running, WorkerState::Unresponsive),
                (WorkerState::Unresponsive, WorkerState::Running),
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_count_only_increases() {
        let f = fixture();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let heartbeat = w.last_heartbeat;

        let mut last = 0;
        for _ in 0..3 {
            let restarted = f.supervisor.restart(&w.id).await.unwrap();
            assert!(restarted.restart_count > last);
            last = restarted.restart_count;
            assert_eq!(restarted.id, w.id);
            assert_eq!(restarted.window, w.window);
            assert_eq!(restarted.last_heartbeat, heartbeat);
        }
        assert_eq!(f.memory.sent_keys("proj", w.window), vec!["C-c"; 3]);

        f.supervisor.terminate(&w.id).await.unwrap();
        let revived = f.supervisor.restart(&w.id).await.unwrap();
        assert_eq!(revived.restart_count, 4);
        assert_eq!(revived.state, WorkerState::Running);
    }

    #[tokio::test]
    async fn test_restart_recreates_lost_window() {
        let f = fixture();
        f.supervisor.spawn(Role::Manager, "proj", SpawnOptions::default()).await.unwrap();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        f.memory.drop_window("proj", w.window);

        let restarted = f.supervisor.restart(&w.id).await.unwrap();

        assert_eq!(restarted.state, WorkerState::Running);
        assert_ne!(restarted.window, w.window);
        assert!(f.memory.has_window("proj", restarted.window).unwrap());
        let session = f.supervisor.session("proj").unwrap();
        assert!(session.window(w.window).is_none());
        assert_eq!(
            session.window(restarted.window).unwrap().worker_id.as_ref(),
            Some(&w.id)
        );
    }

    #[tokio::test]
    async fn test_failed_restart_stops_worker_but_counts() {
        let f = fixture();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        f.memory.set_unavailable(true);

        let result = f.supervisor.restart(&w.id).await;
        assert!(matches!(result, Err(OrchestratorError::SpawnFailed(_))));

        let w = f.supervisor.get(&w.id).unwrap();
        assert_eq!(w.state, WorkerState::Stopped);
        assert_eq!(w.restart_count, 1);
    }

    #[tokio::test]
    async fn test_terminate_releases_window_keeps_session() {
        let f = fixture();
        let a = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let b = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();

        let stopped = f.supervisor.terminate(&b.id).await.unwrap();
        assert_eq!(stopped.state, WorkerState::Stopped);
        assert!(!f.memory.has_window("proj", b.window).unwrap());
        assert!(f.supervisor.session("proj").unwrap().window(b.window).is_none());
        assert_eq!(f.supervisor.get(&a.id).unwrap().state, WorkerState::Running);

        // second terminate is a no-op
        f.supervisor.terminate(&b.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_archive_removes_worker() {
        let f = fixture();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();

        let archived = f.supervisor.archive(&w.id).await.unwrap();
        assert_eq!(archived.state, WorkerState::Stopped);
        assert!(!f.supervisor.contains(&w.id).unwrap());
        assert!(matches!(
            f.supervisor.archive(&w.id).await,
            Err(OrchestratorError::WorkerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_session_removes_workers() {
        let f = fixture();
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();

        let removed = f.supervisor.kill_session("proj").await.unwrap();
        assert_eq!(removed, vec![w.id.clone()]);
        assert!(!f.supervisor.contains(&w.id).unwrap());
        assert_eq!(f.supervisor.session("proj").unwrap().status, SessionStatus::Terminated);
        assert!(!f.memory.session_exists("proj"));

        assert!(matches!(
            f.supervisor.kill_session("nothing").await,
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_stops_orphans() {
        let f = fixture();
        let a = f.supervisor.spawn(Role::Executor, "alpha", SpawnOptions::default()).await.unwrap();
        let b = f.supervisor.spawn(Role::Executor, "alpha", SpawnOptions::default()).await.unwrap();
        let c = f.supervisor.spawn(Role::Executor, "beta", SpawnOptions::default()).await.unwrap();

        f.memory.drop_window("alpha", b.window);
        f.memory.kill_session("beta").unwrap();

        let report = f.supervisor.reconcile().await.unwrap();
        assert_eq!(report.terminated_sessions, vec!["beta".to_string()]);
        let mut stopped = report.stopped_workers.clone();
        stopped.sort();
        let mut expected = vec![b.id.clone(), c.id.clone()];
        expected.sort();
        assert_eq!(stopped, expected);

        assert_eq!(f.supervisor.get(&a.id).unwrap().state, WorkerState::Running);
        assert_eq!(f.supervisor.session("beta").unwrap().status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_table_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let (tx, _rx) = broadcast::channel(8);

        let w = {
            let backend = TimedBackend::new(memory.clone(), Duration::from_secs(1));
            let sup = ProcessSupervisor::open(backend, StateStore::new(dir.path()), HashMap::new(), tx.clone()).unwrap();
            let w = sup.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
            sup.restart(&w.id).await.unwrap();
            w
        };

        let backend = TimedBackend::new(memory, Duration::from_secs(1));
        let sup = ProcessSupervisor::open(backend, StateStore::new(dir.path()), HashMap::new(), tx).unwrap();
        let loaded = sup.get(&w.id).unwrap();
        assert_eq!(loaded.restart_count, 1);
        assert_eq!(loaded.state, WorkerState::Running);

        // the persisted session is managed, so creating it again is idempotent
        assert!(sup.create_session("proj").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_launch_frees_window() {
        let mut launch = HashMap::new();
        launch.insert(Role::Executor, "claude".to_string());
        let f = fixture_with(launch);
        f.memory.refuse("send_input", true);

        let result = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await;
        assert!(matches!(result, Err(OrchestratorError::SpawnFailed(_))));
        assert!(f.supervisor.workers().unwrap().is_empty());
        assert!(f.supervisor.session("proj").unwrap().window(0).unwrap().is_free());

        f.memory.refuse("send_input", false);
        let w = f.supervisor.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        assert_eq!(w.window, 0);
        assert_eq!(w.state, WorkerState::Running);
    }

    #[tokio::test]
    async fn test_heartbeats_are_flushed_on_a_throttle() {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let (tx, _rx) = broadcast::channel(8);
        let backend = TimedBackend::new(memory, Duration::from_secs(1));
        let store = StateStore::new(dir.path());
        let sup = ProcessSupervisor::open(backend, store.clone(), HashMap::new(), tx)
            .unwrap()
            .with_heartbeat_flush(Duration::from_secs(10));
        let w = sup.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        let on_disk = |store: &StateStore| {
            store.load_worker_table().unwrap().workers.into_iter().find(|x| x.id == w.id).unwrap().last_heartbeat
        };

        let soon = w.last_heartbeat + chrono::Duration::seconds(1);
        sup.record_activity(&w.id, soon).unwrap();
        assert_eq!(on_disk(&store), w.last_heartbeat);
        assert_eq!(sup.get(&w.id).unwrap().last_heartbeat, soon);

        let later = w.last_heartbeat + chrono::Duration::seconds(20);
        sup.record_activity(&w.id, later).unwrap();
        assert_eq!(on_disk(&store), later);
    }

    #[tokio::test]
    async fn test_two_supervisors_share_the_table() {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let (tx, _rx) = broadcast::channel(64);
        let open = || {
            let backend = TimedBackend::new(memory.clone(), Duration::from_secs(1));
            ProcessSupervisor::open(backend, StateStore::new(dir.path()), HashMap::new(), tx.clone()).unwrap()
        };
        let daemon = open();
        let cli = open();

        let early = daemon.spawn(Role::Manager, "proj", SpawnOptions::default()).await.unwrap();
        let w = cli.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        assert_eq!(daemon.get(&w.id).unwrap().window, w.window);

        // the daemon's next write keeps the worker the other process added
        daemon.checkpoint().unwrap();
        let beat = early.last_heartbeat + chrono::Duration::seconds(1);
        daemon.record_activity(&early.id, beat).unwrap();
        let late = daemon.spawn(Role::Executor, "proj", SpawnOptions::default()).await.unwrap();
        assert_ne!(late.window, w.window);

        let on_disk: Vec<WorkerId> = StateStore::new(dir.path())
            .load_worker_table()
            .unwrap()
            .workers
            .into_iter()
            .map(|x| x.id)
            .collect();
        for id in [&early.id, &w.id, &late.id] {
            assert!(on_disk.contains(id), "{} missing", id);
        }
        assert_eq!(cli.get(&early.id).unwrap().last_heartbeat, beat);
    }
}
