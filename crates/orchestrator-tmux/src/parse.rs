//! Parsers for tmux `-F` format output.

use chrono::{TimeZone, Utc};

use crate::backend::{BackendSession, BackendWindow};
use crate::{BackendError, Result};

/// Parse a session from a `list-sessions` output line.
///
/// Expected format: `session_name:created_timestamp:attached_count`
pub fn parse_session_line(line: &str) -> Result<BackendSession> {
    let parts: Vec<&str> = line.rsplitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(BackendError::ParseError(format!(
            "invalid session format: {}",
            line
        )));
    }

    // rsplitn yields fields right to left
    let (attached, created, name) = (parts[0], parts[1], parts[2]);

    let timestamp: i64 = created
        .trim()
        .parse()
        .map_err(|_| BackendError::ParseError(format!("invalid timestamp: {}", created)))?;

    let created_at = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| BackendError::ParseError(format!("invalid timestamp: {}", timestamp)))?;

    let attached = attached.trim().parse::<u32>().unwrap_or(0) > 0;

    let mut session = BackendSession::new(name, created_at);
    session.attached = attached;
    Ok(session)
}

/// Parse a window from a `list-windows` output line.
///
/// Expected format: `window_index:window_active:window_name`. The name is
/// last because it may itself contain colons.
pub fn parse_window_line(line: &str) -> Result<BackendWindow> {
    let parts: Vec<&str> = line.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(BackendError::ParseError(format!(
            "invalid window format: {}",
            line
        )));
    }

    let index: u32 = parts[0]
        .parse()
        .map_err(|_| BackendError::ParseError(format!("invalid window index: {}", parts[0])))?;
    let active = parts[1] == "1";

    Ok(BackendWindow::new(index, parts[2], active))
}
