//! Supervised worker types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;
use crate::message::ParseEnumError;

/// Role of a worker in the hub-and-spoke topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Top-level coordinator; may address every worker.
    Orchestrator,
    /// Owns a group of executors.
    Manager,
    /// Does the actual work; reports to one manager.
    Executor,
    /// Observes and reports; only talks to the orchestrator.
    Monitor,
}

impl Role {
    /// All roles, in hierarchy order.
    pub const ALL: [Role; 4] = [
        Role::Orchestrator,
        Role::Manager,
        Role::Executor,
        Role::Monitor,
    ];

    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Orchestrator => "orchestrator",
            Role::Manager => "manager",
            Role::Executor => "executor",
            Role::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "orchestrator" => Ok(Role::Orchestrator),
            "manager" | "project_manager" | "pm" => Ok(Role::Manager),
            "executor" | "developer" | "dev" | "qa" | "devops" | "code_reviewer" | "reviewer"
            | "researcher" | "documentation" => Ok(Role::Executor),
            "monitor" => Ok(Role::Monitor),
            _ => Err(ParseEnumError::new("role", s)),
        }
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Window allocated, process not yet confirmed live.
    #[default]
    Starting,
    /// Process is live and producing heartbeats.
    Running,
    /// No heartbeat within the expected interval.
    Unresponsive,
    /// Terminated; the window has been released.
    Stopped,
}

impl WorkerState {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Unresponsive => "unresponsive",
            WorkerState::Stopped => "stopped",
        }
    }

    /// Returns true if the worker is expected to be producing heartbeats.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Unresponsive)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A supervised logical agent hosted in exactly one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier, stable across restarts.
    pub id: WorkerId,

    /// Role in the routing topology.
    pub role: Role,

    /// Name of the hosting session.
    pub session: String,

    /// Index of the hosting window within the session.
    pub window: u32,

    /// Manager this worker reports to (executors only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<WorkerId>,

    /// Command typed into the window on spawn and restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<String>,

    /// Current lifecycle state.
    pub state: WorkerState,

    /// Last observed activity.
    pub last_heartbeat: DateTime<Utc>,

    /// Number of restarts over the lifetime of this id. Never decreases.
    #[serde(default)]
    pub restart_count: u32,

    /// When the worker was first spawned.
    pub created_at: DateTime<Utc>,

    /// When the process was last (re)started.
    pub started_at: DateTime<Utc>,
}

impl Worker {
    /// Creates a worker in the `Starting` state.
    pub fn new(role: Role, session: impl Into<String>, window: u32) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerId::for_role(role.as_str()),
            role,
            session: session.into(),
            window,
            manager: None,
            launch_command: None,
            state: WorkerState::Starting,
            last_heartbeat: now,
            restart_count: 0,
            created_at: now,
            started_at: now,
        }
    }

    /// Sets the manager.
    pub fn with_manager(mut self, manager: Option<WorkerId>) -> Self {
        self.manager = manager;
        self
    }

    /// Sets the launch command.
    pub fn with_launch_command(mut self, command: Option<String>) -> Self {
        self.launch_command = command;
        self
    }

    /// Returns the tmux-style target `session:window`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.session, self.window)
    }

    /// Seconds of silence as of `now`.
    pub fn silence_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds().max(0)
    }
}
