//! Gap events raised by the health monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GapId, WorkerId};

/// A detected period of worker silence. Retained forever for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapEvent {
    /// Unique identifier.
    pub id: GapId,
    /// Silent worker.
    pub worker_id: WorkerId,
    /// When the gap was flagged.
    pub detected_at: DateTime<Utc>,
    /// Silence at detection time.
    pub duration_seconds: i64,
    /// Flipped when the worker is Running again.
    pub resolved: bool,
    /// When the gap was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Recovery attempts made for this gap.
    #[serde(default)]
    pub recovery_attempts: u32,
    /// Time of the most recent recovery attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recovery_at: Option<DateTime<Utc>>,
    /// True once the gap was escalated; no further automatic attempts.
    #[serde(default)]
    pub escalated: bool,
    /// Set when someone takes ownership; no further automatic attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl GapEvent {
    /// Creates an unresolved gap.
    pub fn new(worker_id: WorkerId, detected_at: DateTime<Utc>, duration_seconds: i64) -> Self {
        Self {
            id: GapId::new(),
            worker_id,
            detected_at,
            duration_seconds,
            resolved: false,
            resolved_at: None,
            recovery_attempts: 0,
            last_recovery_at: None,
            escalated: false,
            acknowledged_at: None,
        }
    }

    /// Marks the gap resolved.
    pub fn resolve(&mut self, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Marks the gap acknowledged. A second acknowledgement keeps the first time.
    pub fn acknowledge(&mut self, at: DateTime<Utc>) {
        self.acknowledged_at.get_or_insert(at);
    }

    /// Records a recovery attempt.
    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.recovery_attempts += 1;
        self.last_recovery_at = Some(at);
    }
}
