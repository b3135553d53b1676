//! Session backend driving the `tmux` command-line tool.

use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::{debug, trace, warn};

use crate::backend::{target, validate_name, BackendSession, BackendWindow, SessionBackend};
use crate::parse::{parse_session_line, parse_window_line};
use crate::{BackendError, Result};

const SESSION_FORMAT: &str = "#{session_name}:#{session_created}:#{session_attached}";
const WINDOW_FORMAT: &str = "#{window_index}:#{window_active}:#{window_name}";

/// Backend that shells out to tmux.
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    /// Path to tmux binary.
    tmux_path: PathBuf,
}

impl TmuxBackend {
    /// Create a new TmuxBackend.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::NotFound` if tmux is not available.
    pub fn new() -> Result<Self> {
        let tmux_path = which::which("tmux").map_err(|_| BackendError::NotFound)?;
        debug!(path = %tmux_path.display(), "tmux found");
        Ok(Self { tmux_path })
    }

    /// Check if tmux is available in PATH.
    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    /// Run a tmux command and return the output.
    fn run_tmux(&self, args: &[&str]) -> Result<Output> {
        trace!(args = ?args, "running tmux command");
        let output = Command::new(&self.tmux_path).args(args).output()?;
        trace!(
            status = %output.status,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "tmux command completed"
        );
        Ok(output)
    }

    /// Run a tmux command and check for success.
    fn run_tmux_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run_tmux(args)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(BackendError::CommandFailed(stderr))
        }
    }

    fn list_windows(&self, session: &str) -> Result<Vec<BackendWindow>> {
        let output = self.run_tmux_checked(&["list-windows", "-t", session, "-F", WINDOW_FORMAT])?;

        let mut windows = Vec::new();
        for line in output.lines().filter(|l| !l.is_empty()) {
            match parse_window_line(line) {
                Ok(window) => windows.push(window),
                Err(e) => warn!(line = %line, error = %e, "failed to parse window"),
            }
        }
        Ok(windows)
    }

    fn find_session(&self, name: &str) -> Result<BackendSession> {
        self.list_sessions()?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BackendError::SessionNotFound(name.to_string()))
    }

    /// Fails with `TargetNotFound` unless the window exists.
    fn require_window(&self, session: &str, window: u32) -> Result<String> {
        if !self.has_window(session, window)? {
            return Err(BackendError::TargetNotFound(target(session, window)));
        }
        Ok(target(session, window))
    }
}

impl SessionBackend for TmuxBackend {
    fn create_session(&self, name: &str) -> Result<BackendSession> {
        validate_name(name)?;

        if self.session_exists(name) {
            debug!(name = %name, "session already exists");
            return self.find_session(name);
        }

        debug!(name = %name, "creating tmux session");
        self.run_tmux_checked(&["new-session", "-d", "-s", name])?;

        self.find_session(name).map_err(|_| {
            BackendError::CommandFailed(format!("session '{}' was not created", name))
        })
    }

    fn create_window(&self, session: &str, title: &str) -> Result<BackendWindow> {
        validate_name(title)?;
        if !self.session_exists(session) {
            return Err(BackendError::SessionNotFound(session.to_string()));
        }

        if let Some(existing) = self
            .list_windows(session)?
            .into_iter()
            .find(|w| w.title == title)
        {
            return Ok(existing);
        }

        debug!(session = %session, title = %title, "creating window");
        let output = self.run_tmux_checked(&[
            "new-window",
            "-d",
            "-t",
            session,
            "-n",
            title,
            "-P",
            "-F",
            WINDOW_FORMAT,
        ])?;

        let line = output.lines().next().unwrap_or_default();
        parse_window_line(line)
    }

    fn rename_window(&self, session: &str, window: u32, title: &str) -> Result<()> {
        validate_name(title)?;
        let target = self.require_window(session, window)?;
        self.run_tmux_checked(&["rename-window", "-t", &target, title])?;
        Ok(())
    }

    fn send_input(&self, session: &str, window: u32, text: &str) -> Result<()> {
        debug!(session = %session, window = window, len = text.len(), "sending input");
        let target = self.require_window(session, window)?;

        // -l sends the text literally so words like "Enter" are not key names
        self.run_tmux_checked(&["send-keys", "-t", &target, "-l", text])?;
        self.run_tmux_checked(&["send-keys", "-t", &target, "Enter"])?;
        Ok(())
    }

    fn send_keys(&self, session: &str, window: u32, keys: &str) -> Result<()> {
        debug!(session = %session, window = window, keys = %keys, "sending keys");
        let target = self.require_window(session, window)?;
        self.run_tmux_checked(&["send-keys", "-t", &target, keys])?;
        Ok(())
    }

    fn capture_pane(&self, session: &str, window: u32, lines: u32) -> Result<String> {
        let target = self.require_window(session, window)?;
        let start = format!("-{}", lines);
        self.run_tmux_checked(&["capture-pane", "-t", &target, "-p", "-S", &start])
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        if !self.session_exists(name) {
            debug!(name = %name, "session already gone");
            return Ok(());
        }

        debug!(name = %name, "killing tmux session");
        self.run_tmux_checked(&["kill-session", "-t", name])?;
        Ok(())
    }

    fn kill_window(&self, session: &str, window: u32) -> Result<()> {
        if !self.session_exists(session) || !self.has_window(session, window)? {
            return Ok(());
        }

        debug!(session = %session, window = window, "killing window");
        self.run_tmux_checked(&["kill-window", "-t", &target(session, window)])?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<BackendSession>> {
        let output = self.run_tmux(&["list-sessions", "-F", SESSION_FORMAT])?;

        // If no sessions exist, tmux returns non-zero exit code
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(BackendError::CommandFailed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut sessions = Vec::new();

        for line in stdout.lines().filter(|l| !l.is_empty()) {
            match parse_session_line(line) {
                Ok(mut session) => {
                    if let Ok(windows) = self.list_windows(&session.name) {
                        session.windows = windows;
                    }
                    sessions.push(session);
                }
                Err(e) => {
                    warn!(line = %line, error = %e, "failed to parse session");
                }
            }
        }

        Ok(sessions)
    }

    fn session_exists(&self, name: &str) -> bool {
        let output = self.run_tmux(&["has-session", "-t", name]);
        matches!(output, Ok(o) if o.status.success())
    }

    fn has_window(&self, session: &str, window: u32) -> Result<bool> {
        if !self.session_exists(session) {
            return Err(BackendError::SessionNotFound(session.to_string()));
        }
        Ok(self.list_windows(session)?.iter().any(|w| w.index == window))
    }
}
