//! The session backend seam.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{BackendError, Result};

/// A session as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSession {
    /// Session name.
    pub name: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Whether a client is attached.
    pub attached: bool,
    /// Windows in this session.
    pub windows: Vec<BackendWindow>,
}

impl BackendSession {
    /// Create a new BackendSession with no windows.
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created_at,
            attached: false,
            windows: Vec::new(),
        }
    }

    /// Looks up a window by index.
    pub fn window(&self, index: u32) -> Option<&BackendWindow> {
        self.windows.iter().find(|w| w.index == index)
    }
}

/// A window as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendWindow {
    /// Window index within the session.
    pub index: u32,
    /// Window title.
    pub title: String,
    /// Whether this is the session's active window.
    pub active: bool,
}

impl BackendWindow {
    /// Create a new BackendWindow.
    pub fn new(index: u32, title: impl Into<String>, active: bool) -> Self {
        Self {
            index,
            title: title.into(),
            active,
        }
    }
}

/// Narrow adapter over a terminal multiplexer.
///
/// Creation calls are idempotent: asking for a session (or a window title)
/// that already exists returns the existing resource. Everything else fails
/// fast with a typed [`BackendError`]. Calls may block on an external
/// process; callers wrap them with a timeout.
pub trait SessionBackend: Send + Sync {
    /// Creates a detached session, or returns it if it already exists.
    fn create_session(&self, name: &str) -> Result<BackendSession>;

    /// Creates a window in `session`, or returns the window already titled `title`.
    fn create_window(&self, session: &str, title: &str) -> Result<BackendWindow>;

    /// Renames a window.
    fn rename_window(&self, session: &str, window: u32, title: &str) -> Result<()>;

    /// Types `text` into the window followed by Enter.
    fn send_input(&self, session: &str, window: u32, text: &str) -> Result<()>;

    /// Sends raw key names (e.g. `C-c`) to the window.
    fn send_keys(&self, session: &str, window: u32, keys: &str) -> Result<()>;

    /// Captures the last `lines` lines of the window's pane.
    fn capture_pane(&self, session: &str, window: u32, lines: u32) -> Result<String>;

    /// Kills a session. Killing a missing session is a no-op.
    fn kill_session(&self, name: &str) -> Result<()>;

    /// Kills a window. Killing a missing window is a no-op.
    fn kill_window(&self, session: &str, window: u32) -> Result<()>;

    /// Lists all sessions with their windows.
    ///
    /// The returned snapshot is finite; call again for a fresh one.
    fn list_sessions(&self) -> Result<Vec<BackendSession>>;

    /// Check if a session exists.
    fn session_exists(&self, name: &str) -> bool;

    /// Check if a window exists in a session.
    fn has_window(&self, session: &str, window: u32) -> Result<bool>;
}

/// Formats a window target the way tmux expects it.
pub fn target(session: &str, window: u32) -> String {
    format!("{}:{}", session, window)
}

/// Validates a session or window name.
///
/// Names must be non-empty and free of `:`, `.` and whitespace, which tmux
/// uses as target separators.
pub fn validate_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| Regex::new(r"^[^:.\s]+$").expect("static regex"));
    if re.is_match(name) {
        Ok(())
    } else {
        Err(BackendError::InvalidName(name.to_string()))
    }
}
