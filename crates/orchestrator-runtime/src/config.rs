//! Runtime configuration.
//!
//! Values come from [`RuntimeConfig::default`], then an optional
//! `<root>/config.json`, then `ORCHESTRATOR_*` environment variables.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use orchestrator_conversation::Budget;
use orchestrator_models::Role;
use orchestrator_persistence::atomic::read_json_optional;
use serde::Deserialize;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Environment variable naming the state directory.
pub const ROOT_ENV: &str = "ORCHESTRATOR_ROOT";
/// Overrides `heartbeat_interval` (seconds).
pub const HEARTBEAT_ENV: &str = "ORCHESTRATOR_HEARTBEAT_SECS";
/// Overrides `backend_timeout` (seconds).
pub const BACKEND_TIMEOUT_ENV: &str = "ORCHESTRATOR_BACKEND_TIMEOUT_SECS";
/// Overrides `message_budget`.
pub const MESSAGE_BUDGET_ENV: &str = "ORCHESTRATOR_MESSAGE_BUDGET";
/// Overrides `keep_recent`.
pub const KEEP_RECENT_ENV: &str = "ORCHESTRATOR_KEEP_RECENT";
/// Overrides `max_restart_attempts`.
pub const MAX_RESTARTS_ENV: &str = "ORCHESTRATOR_MAX_RESTARTS";

/// File name of the optional config file inside the root.
pub const CONFIG_FILE: &str = "config.json";

/// Configuration for the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Silence after which a running worker becomes unresponsive (T).
    /// Silence beyond twice this flags a gap.
    pub heartbeat_interval: Duration,
    /// How often the health monitor sweeps.
    pub sweep_interval: Duration,
    /// How often the scheduler checks for due check-ins.
    pub scheduler_tick: Duration,
    /// How often pane output is captured.
    pub poll_interval: Duration,
    /// Upper bound on any single backend call.
    pub backend_timeout: Duration,
    /// Raw messages per conversation before compaction.
    pub message_budget: usize,
    /// Estimated tokens per conversation before compaction.
    pub token_budget: usize,
    /// Messages kept verbatim by compaction.
    pub keep_recent: usize,
    /// Longest accepted message body, in bytes.
    pub max_body_len: usize,
    /// Lines captured per poll.
    pub capture_lines: u32,
    /// Restarts the default recovery tries per gap before escalating.
    pub max_restart_attempts: u32,
    /// Command typed into a new window, per role.
    pub launch_commands: HashMap<Role, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            scheduler_tick: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            backend_timeout: Duration::from_secs(5),
            message_budget: 50,
            token_budget: 8000,
            keep_recent: 10,
            max_body_len: 16 * 1024,
            capture_lines: 50,
            max_restart_attempts: 1,
            launch_commands: HashMap::new(),
        }
    }
}

/// On-disk form: every field optional, durations in whole seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    heartbeat_interval_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    scheduler_tick_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    backend_timeout_secs: Option<u64>,
    message_budget: Option<usize>,
    token_budget: Option<usize>,
    keep_recent: Option<usize>,
    max_body_len: Option<usize>,
    capture_lines: Option<u32>,
    max_restart_attempts: Option<u32>,
    launch_commands: HashMap<Role, String>,
}

impl RuntimeConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, `<root>/config.json` and environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let config = Self::default()
            .merge_file(&root.join(CONFIG_FILE))?
            .apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn merge_file(mut self, path: &Path) -> Result<Self> {
        let Some(file) = read_json_optional::<FileConfig>(path)? else {
            return Ok(self);
        };
        debug!(path = %path.display(), "loaded config file");

        let secs = Duration::from_secs;
        if let Some(v) = file.heartbeat_interval_secs {
            self.heartbeat_interval = secs(v);
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval = secs(v);
        }
        if let Some(v) = file.scheduler_tick_secs {
            self.scheduler_tick = secs(v);
        }
        if let Some(v) = file.poll_interval_secs {
            self.poll_interval = secs(v);
        }
        if let Some(v) = file.backend_timeout_secs {
            self.backend_timeout = secs(v);
        }
        self.message_budget = file.message_budget.unwrap_or(self.message_budget);
        self.token_budget = file.token_budget.unwrap_or(self.token_budget);
        self.keep_recent = file.keep_recent.unwrap_or(self.keep_recent);
        self.max_body_len = file.max_body_len.unwrap_or(self.max_body_len);
        self.capture_lines = file.capture_lines.unwrap_or(self.capture_lines);
        self.max_restart_attempts = file.max_restart_attempts.unwrap_or(self.max_restart_attempts);
        self.launch_commands.extend(file.launch_commands);
        Ok(self)
    }

    /// Applies `ORCHESTRATOR_*` overrides read through `lookup`.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.trim().parse().map_err(|_| {
                OrchestratorError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, value))
            })
        }

        if let Some(v) = lookup(HEARTBEAT_ENV) {
            self.heartbeat_interval = Duration::from_secs(parse(HEARTBEAT_ENV, &v)?);
        }
        if let Some(v) = lookup(BACKEND_TIMEOUT_ENV) {
            self.backend_timeout = Duration::from_secs(parse(BACKEND_TIMEOUT_ENV, &v)?);
        }
        if let Some(v) = lookup(MESSAGE_BUDGET_ENV) {
            self.message_budget = parse(MESSAGE_BUDGET_ENV, &v)?;
        }
        if let Some(v) = lookup(KEEP_RECENT_ENV) {
            self.keep_recent = parse(KEEP_RECENT_ENV, &v)?;
        }
        if let Some(v) = lookup(MAX_RESTARTS_ENV) {
            self.max_restart_attempts = parse(MAX_RESTARTS_ENV, &v)?;
        }
        Ok(self)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("sweep_interval", self.sweep_interval),
            ("scheduler_tick", self.scheduler_tick),
            ("poll_interval", self.poll_interval),
            ("backend_timeout", self.backend_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(OrchestratorError::Configuration(format!("{} must be positive", name)));
            }
        }
        if self.max_body_len == 0 {
            return Err(OrchestratorError::Configuration("max_body_len must be positive".into()));
        }
        Ok(())
    }

    /// Compaction thresholds for the conversation store.
    pub fn budget(&self) -> Budget {
        Budget {
            messages: self.message_budget,
            tokens: self.token_budget,
            keep_recent: self.keep_recent,
        }
    }

    /// Launch command configured for `role`.
    pub fn launch_command(&self, role: Role) -> Option<&str> {
        self.launch_commands.get(&role).map(String::as_str)
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_message_budget(mut self, budget: usize) -> Self {
        self.message_budget = budget;
        self
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_keep_recent(mut self, keep: usize) -> Self {
        self.keep_recent = keep;
        self
    }

    pub fn with_max_body_len(mut self, len: usize) -> Self {
        self.max_body_len = len;
        self
    }

    /// Sets how many restarts a gap gets before escalation (0 escalates at once).
    pub fn with_max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    pub fn with_launch_command(mut self, role: Role, command: impl Into<String>) -> Self {
        self.launch_commands.insert(role, command.into());
        self
    }
}
