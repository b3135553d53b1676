//! Session and window types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A client is attached.
    Active,
    /// Running without an attached client.
    #[default]
    Detached,
    /// Killed, or no longer reported by the backend.
    Terminated,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Detached => "detached",
            SessionStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A window inside a session, hosting at most one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Index, unique within the session.
    pub index: u32,
    /// Window title.
    pub title: String,
    /// Worker hosted in this window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

impl Window {
    /// Creates an unoccupied window.
    pub fn new(index: u32, title: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            worker_id: None,
        }
    }

    /// Returns true if no worker occupies the window.
    pub fn is_free(&self) -> bool {
        self.worker_id.is_none()
    }
}

/// A named execution context owning zero or more windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session name, unique.
    pub id: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: SessionStatus,
    /// Windows, ordered by index.
    #[serde(default)]
    pub windows: Vec<Window>,
}

impl Session {
    /// Creates a detached session with no windows.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            status: SessionStatus::Detached,
            windows: Vec::new(),
        }
    }

    /// Looks up a window by index.
    pub fn window(&self, index: u32) -> Option<&Window> {
        self.windows.iter().find(|w| w.index == index)
    }

    /// Looks up a window by index for mutation.
    pub fn window_mut(&mut self, index: u32) -> Option<&mut Window> {
        self.windows.iter_mut().find(|w| w.index == index)
    }

    /// Returns the lowest-indexed window without a worker.
    pub fn free_window(&self) -> Option<&Window> {
        self.windows.iter().filter(|w| w.is_free()).min_by_key(|w| w.index)
    }

    /// Inserts or replaces a window, keeping the list ordered by index.
    pub fn upsert_window(&mut self, window: Window) {
        match self.windows.iter_mut().find(|w| w.index == window.index) {
            Some(existing) => *existing = window,
            None => {
                self.windows.push(window);
                self.windows.sort_by_key(|w| w.index);
            }
        }
    }

    /// Removes a window by index.
    pub fn remove_window(&mut self, index: u32) -> Option<Window> {
        let pos = self.windows.iter().position(|w| w.index == index)?;
        Some(self.windows.remove(pos))
    }

    /// Returns true unless the session has been terminated.
    pub fn is_alive(&self) -> bool {
        self.status != SessionStatus::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_window_prefers_lowest_index() {
        let mut session = Session::new("proj", Utc::now());
        session.upsert_window(Window::new(2, "b"));
        session.upsert_window(Window::new(0, "a"));

        assert_eq!(session.windows[0].index, 0);
        assert_eq!(session.free_window().map(|w| w.index), Some(0));

        session.window_mut(0).unwrap().worker_id = Some(WorkerId::from("w"));
        assert_eq!(session.free_window().map(|w| w.index), Some(2));
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let mut session = Session::new("proj", Utc::now());
        session.upsert_window(Window::new(0, "old"));
        session.upsert_window(Window::new(0, "new"));
        assert_eq!(session.windows.len(), 1);
        assert_eq!(session.windows[0].title, "new");
    }

    #[test]
    fn test_remove_window() {
        let mut session = Session::new("proj", Utc::now());
        session.upsert_window(Window::new(0, "a"));
        assert!(session.remove_window(0).is_some());
        assert!(session.remove_window(0).is_none());
        assert!(session.free_window().is_none());
    }
}
