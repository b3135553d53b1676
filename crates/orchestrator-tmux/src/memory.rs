//! In-memory session backend.
//!
//! Mirrors tmux semantics closely enough to exercise the supervisor, router
//! and health monitor without a terminal server: a new session starts with a
//! `shell` window at index 0, window indexes grow monotonically, and input
//! sent to a window is recorded for inspection (and optionally echoed into
//! the pane, as a shell would). Failure and latency can be injected to drive
//! error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::backend::{target, validate_name, BackendSession, BackendWindow, SessionBackend};
use crate::{BackendError, Result};

/// Title given to the first window of a new session.
pub const INITIAL_WINDOW_TITLE: &str = "shell";

#[derive(Debug, Default)]
struct MemoryWindow {
    title: String,
    input: Vec<String>,
    keys: Vec<String>,
    output: String,
}

#[derive(Debug)]
struct MemorySession {
    created_at: DateTime<Utc>,
    attached: bool,
    windows: BTreeMap<u32, MemoryWindow>,
    next_index: u32,
}

impl MemorySession {
    fn new() -> Self {
        let mut windows = BTreeMap::new();
        windows.insert(
            0,
            MemoryWindow {
                title: INITIAL_WINDOW_TITLE.to_string(),
                ..Default::default()
            },
        );
        Self {
            created_at: Utc::now(),
            attached: false,
            windows,
            next_index: 1,
        }
    }

    fn snapshot(&self, name: &str) -> BackendSession {
        let mut session = BackendSession::new(name, self.created_at);
        session.attached = self.attached;
        let last = self.windows.keys().next_back().copied();
        session.windows = self
            .windows
            .iter()
            .map(|(index, w)| BackendWindow::new(*index, w.title.clone(), Some(*index) == last))
            .collect();
        session
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<String, MemorySession>,
    unavailable: bool,
    refused: BTreeSet<String>,
    echo_input: bool,
    latency: Option<Duration>,
}

/// Backend that keeps sessions in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| BackendError::Unavailable(format!("lock poisoned: {}", e)))
    }

    /// Locks state for a mutating call, applying injected latency and failure.
    fn state_for_call(&self, op: &str) -> Result<MutexGuard<'_, MemoryState>> {
        let latency = self.state()?.latency;
        if let Some(delay) = latency {
            std::thread::sleep(delay);
        }
        let state = self.state()?;
        if state.unavailable || state.refused.contains(op) {
            return Err(BackendError::Unavailable(format!("{} refused", op)));
        }
        Ok(state)
    }

    /// Makes every subsequent operation fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state() {
            state.unavailable = unavailable;
        }
    }

    /// Makes one operation (by trait method name) fail while others succeed.
    pub fn refuse(&self, op: &str, refused: bool) {
        if let Ok(mut state) = self.state() {
            if refused {
                state.refused.insert(op.to_string());
            } else {
                state.refused.remove(op);
            }
        }
    }

    /// Appends typed input to the pane output, like a terminal echoing it.
    pub fn set_echo_input(&self, echo: bool) {
        if let Ok(mut state) = self.state() {
            state.echo_input = echo;
        }
    }

    /// Delays every subsequent operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut state) = self.state() {
            state.latency = latency;
        }
    }

    /// Registers an existing session with the given windows.
    ///
    /// Used to mirror a persisted worker table when running without tmux.
    pub fn seed_session(&self, name: &str, windows: &[(u32, String)]) {
        if let Ok(mut state) = self.state() {
            let session = state
                .sessions
                .entry(name.to_string())
                .or_insert_with(MemorySession::new);
            for (index, title) in windows {
                session.windows.entry(*index).or_default().title = title.clone();
                session.next_index = session.next_index.max(index + 1);
            }
        }
    }

    /// Appends text to a window's pane output.
    pub fn push_output(&self, session: &str, window: u32, text: &str) {
        if let Ok(mut state) = self.state() {
            if let Some(w) = state
                .sessions
                .get_mut(session)
                .and_then(|s| s.windows.get_mut(&window))
            {
                w.output.push_str(text);
            }
        }
    }

    /// Removes a window without going through `kill_window`, as if its process died.
    pub fn drop_window(&self, session: &str, window: u32) {
        if let Ok(mut state) = self.state() {
            if let Some(s) = state.sessions.get_mut(session) {
                s.windows.remove(&window);
            }
        }
    }

    /// Returns the lines typed into a window.
    pub fn sent_input(&self, session: &str, window: u32) -> Vec<String> {
        self.with_window(session, window, |w| w.input.clone())
            .unwrap_or_default()
    }

    /// Returns the raw keys sent to a window.
    pub fn sent_keys(&self, session: &str, window: u32) -> Vec<String> {
        self.with_window(session, window, |w| w.keys.clone())
            .unwrap_or_default()
    }

    fn with_window<T>(&self, session: &str, window: u32, f: impl FnOnce(&MemoryWindow) -> T) -> Option<T> {
        let state = self.state().ok()?;
        state
            .sessions
            .get(session)
            .and_then(|s| s.windows.get(&window))
            .map(f)
    }
}

fn window_mut<'a>(
    state: &'a mut MemoryState,
    session: &str,
    window: u32,
) -> Result<&'a mut MemoryWindow> {
    let s = state
        .sessions
        .get_mut(session)
        .ok_or_else(|| BackendError::SessionNotFound(session.to_string()))?;
    s.windows
        .get_mut(&window)
        .ok_or_else(|| BackendError::TargetNotFound(target(session, window)))
}

impl SessionBackend for MemoryBackend {
    fn create_session(&self, name: &str) -> Result<BackendSession> {
        validate_name(name)?;
        let mut state = self.state_for_call("create_session")?;
        let session = state
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name = %name, "creating in-memory session");
                MemorySession::new()
            });
        Ok(session.snapshot(name))
    }

    fn create_window(&self, session: &str, title: &str) -> Result<BackendWindow> {
        validate_name(title)?;
        let mut state = self.state_for_call("create_window")?;
        let s = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| BackendError::SessionNotFound(session.to_string()))?;

        if let Some((index, _)) = s.windows.iter().find(|(_, w)| w.title == title) {
            return Ok(BackendWindow::new(*index, title, false));
        }

        let index = s.next_index;
        s.next_index += 1;
        s.windows.insert(
            index,
            MemoryWindow {
                title: title.to_string(),
                ..Default::default()
            },
        );
        Ok(BackendWindow::new(index, title, false))
    }

    fn rename_window(&self, session: &str, window: u32, title: &str) -> Result<()> {
        validate_name(title)?;
        let mut state = self.state_for_call("rename_window")?;
        window_mut(&mut state, session, window)?.title = title.to_string();
        Ok(())
    }

    fn send_input(&self, session: &str, window: u32, text: &str) -> Result<()> {
        let mut state = self.state_for_call("send_input")?;
        let echo = state.echo_input;
        let w = window_mut(&mut state, session, window)?;
        w.input.push(text.to_string());
        if echo {
            w.output.push_str(text);
            w.output.push('\n');
        }
        Ok(())
    }

    fn send_keys(&self, session: &str, window: u32, keys: &str) -> Result<()> {
        let mut state = self.state_for_call("send_keys")?;
        window_mut(&mut state, session, window)?
            .keys
            .push(keys.to_string());
        Ok(())
    }

    fn capture_pane(&self, session: &str, window: u32, lines: u32) -> Result<String> {
        let mut state = self.state_for_call("capture_pane")?;
        let output = &window_mut(&mut state, session, window)?.output;
        let all: Vec<&str> = output.lines().collect();
        let skip = all.len().saturating_sub(lines as usize);
        Ok(all[skip..].join("\n"))
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let mut state = self.state_for_call("kill_session")?;
        state.sessions.remove(name);
        Ok(())
    }

    fn kill_window(&self, session: &str, window: u32) -> Result<()> {
        let mut state = self.state_for_call("kill_window")?;
        if let Some(s) = state.sessions.get_mut(session) {
            s.windows.remove(&window);
        }
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<BackendSession>> {
        let state = self.state_for_call("list_sessions")?;
        Ok(state
            .sessions
            .iter()
            .map(|(name, s)| s.snapshot(name))
            .collect())
    }

    fn session_exists(&self, name: &str) -> bool {
        self.state()
            .map(|s| s.sessions.contains_key(name))
            .unwrap_or(false)
    }

    fn has_window(&self, session: &str, window: u32) -> Result<bool> {
        let state = self.state_for_call("has_window")?;
        let s = state
            .sessions
            .get(session)
            .ok_or_else(|| BackendError::SessionNotFound(session.to_string()))?;
        Ok(s.windows.contains_key(&window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_session_is_idempotent() {
        let backend = MemoryBackend::new();
        let first = backend.create_session("proj").unwrap();
        let second = backend.create_session("proj").unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.list_sessions().unwrap().len(), 1);
        assert_eq!(first.windows.len(), 1);
        assert_eq!(first.windows[0].title, INITIAL_WINDOW_TITLE);
    }

    #[test]
    fn test_create_window_missing_session() {
        let backend = MemoryBackend::new();
        let result = backend.create_window("nope", "executor-1");
        assert!(matches!(result, Err(BackendError::SessionNotFound(_))));
    }

    #[test]
    fn test_create_window_is_idempotent_on_title() {
        let backend = MemoryBackend::new();
        backend.create_session("proj").unwrap();
        let a = backend.create_window("proj", "executor-1").unwrap();
        let b = backend.create_window("proj", "executor-1").unwrap();
        let c = backend.create_window("proj", "executor-2").unwrap();

        assert_eq!(a.index, 1);
        assert_eq!(a.index, b.index);
        assert_eq!(c.index, 2);
    }

    #[test]
    fn test_send_input_records_and_rejects_missing_target() {
        let backend = MemoryBackend::new();
        backend.create_session("proj").unwrap();
        backend.send_input("proj", 0, "hello").unwrap();
        assert_eq!(backend.sent_input("proj", 0), vec!["hello".to_string()]);

        let result = backend.send_input("proj", 9, "hello");
        assert!(matches!(result, Err(BackendError::TargetNotFound(t)) if t == "proj:9"));
    }

    #[test]
    fn test_capture_pane_returns_last_lines() {
        let backend = MemoryBackend::new();
        backend.create_session("proj").unwrap();
        backend.push_output("proj", 0, "one\ntwo\nthree\n");

        assert_eq!(backend.capture_pane("proj", 0, 2).unwrap(), "two\nthree");
        assert_eq!(backend.capture_pane("proj", 0, 10).unwrap(), "one\ntwo\nthree");
    }

    #[test]
    fn test_kill_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.create_session("proj").unwrap();
        backend.kill_window("proj", 0).unwrap();
        backend.kill_window("proj", 0).unwrap();
        backend.kill_session("proj").unwrap();
        backend.kill_session("proj").unwrap();
        assert!(!backend.session_exists("proj"));
    }

    #[test]
    fn test_unavailable_backend_fails() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        assert!(matches!(
            backend.create_session("proj"),
            Err(BackendError::Unavailable(_))
        ));
        backend.set_unavailable(false);
        assert!(backend.create_session("proj").is_ok());
    }

    #[test]
    fn test_seed_session_keeps_indexes() {
        let backend = MemoryBackend::new();
        backend.seed_session("proj", &[(3, "executor-x".to_string())]);
        assert!(backend.has_window("proj", 3).unwrap());

        let next = backend.create_window("proj", "executor-y").unwrap();
        assert_eq!(next.index, 4);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.create_session("a:b"),
            Err(BackendError::InvalidName(_))
        ));
    }

    #[test]
    fn test_refused_op_and_echo() {
        let backend = MemoryBackend::new();
        backend.create_session("proj").unwrap();
        backend.set_echo_input(true);
        backend.send_input("proj", 0, "hello").unwrap();
        assert_eq!(backend.capture_pane("proj", 0, 10).unwrap(), "hello");

        backend.refuse("send_input", true);
        assert!(matches!(
            backend.send_input("proj", 0, "again"),
            Err(BackendError::Unavailable(_))
        ));
        assert!(backend.rename_window("proj", 0, "renamed").is_ok());
        backend.refuse("send_input", false);
        assert!(backend.send_input("proj", 0, "again").is_ok());
    }
}
