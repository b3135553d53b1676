//! Scheduled check-ins.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CheckInId, WorkerId};

/// A delayed, optionally recurring, check-in against a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCheckIn {
    /// Unique identifier.
    pub id: CheckInId,
    /// Worker the check-in is sent to.
    pub target_worker_id: WorkerId,
    /// When the check-in is due.
    pub fire_at: DateTime<Utc>,
    /// Body of the coordination message.
    pub note: String,
    /// Re-inserted after firing when true.
    pub recurring: bool,
    /// Repeat interval for recurring check-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
}

impl ScheduledCheckIn {
    /// Creates a check-in due `delay_seconds` after `now`.
    ///
    /// A recurring check-in without an interval repeats every `delay_seconds`.
    pub fn new(
        target_worker_id: WorkerId,
        now: DateTime<Utc>,
        delay_seconds: u64,
        note: impl Into<String>,
        recurring: bool,
        interval_seconds: Option<u64>,
    ) -> Self {
        let interval_seconds = if recurring {
            Some(interval_seconds.unwrap_or(delay_seconds).max(1))
        } else {
            None
        };
        Self {
            id: CheckInId::new(),
            target_worker_id,
            fire_at: now + seconds(delay_seconds),
            note: note.into(),
            recurring,
            interval_seconds,
        }
    }

    /// Returns true if the check-in is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }

    /// Returns the next occurrence after firing at `now`, if recurring.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<Self> {
        let interval = self.interval_seconds.filter(|_| self.recurring)?;
        let mut next = self.clone();
        next.fire_at = now + seconds(interval);
        Some(next)
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_has_no_next() {
        let now = Utc::now();
        let c = ScheduledCheckIn::new("w1".into(), now, 30, "ping", false, Some(10));
        assert_eq!(c.fire_at, now + Duration::seconds(30));
        assert!(c.interval_seconds.is_none());
        assert!(c.next_occurrence(now).is_none());
        assert!(!c.is_due(now));
        assert!(c.is_due(now + Duration::seconds(30)));
    }

    #[test]
    fn test_recurring_defaults_interval_to_delay() {
        let now = Utc::now();
        let c = ScheduledCheckIn::new("w1".into(), now, 15, "ping", true, None);
        assert_eq!(c.interval_seconds, Some(15));

        let fired_at = c.fire_at;
        let next = c.next_occurrence(fired_at).unwrap();
        assert_eq!(next.id, c.id);
        assert_eq!(next.fire_at, fired_at + Duration::seconds(15));
    }
}
