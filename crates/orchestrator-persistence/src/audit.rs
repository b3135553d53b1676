//! Router audit trails: rejected messages and the communication log.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use orchestrator_models::{Message, MessageId, MessageKind, Priority, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jsonl::{append_record, read_records};

const LOGS_DIR: &str = "logs";
const REJECTED_FILE: &str = "rejected.jsonl";
const COMMUNICATION_FILE: &str = "communication.jsonl";

/// A message the router refused, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedMessage {
    pub message: Message,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

/// Metadata of an accepted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationRecord {
    pub message_id: MessageId,
    /// Display form of the sender (`worker-id` or `@external`).
    pub from: String,
    pub to: WorkerId,
    pub kind: MessageKind,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
}

impl CommunicationRecord {
    pub fn from_message(message: &Message, delivered: bool) -> Self {
        Self {
            message_id: message.id.clone(),
            from: message.from.to_string(),
            to: message.to.clone(),
            kind: message.kind,
            priority: message.priority,
            timestamp: message.timestamp,
            delivered,
        }
    }
}

/// Append-only audit files under `<root>/logs/`.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(LOGS_DIR),
        }
    }

    pub fn record_rejected(&self, rejected: &RejectedMessage) -> Result<()> {
        append_record(&self.dir.join(REJECTED_FILE), rejected)
    }

    pub fn rejected(&self) -> Result<Vec<RejectedMessage>> {
        read_records(&self.dir.join(REJECTED_FILE))
    }

    pub fn record_communication(&self, record: &CommunicationRecord) -> Result<()> {
        append_record(&self.dir.join(COMMUNICATION_FILE), record)
    }

    /// Reads communication records with `timestamp >= since`.
    pub fn communications_since(&self, since: DateTime<Utc>) -> Result<Vec<CommunicationRecord>> {
        let mut records: Vec<CommunicationRecord> =
            read_records(&self.dir.join(COMMUNICATION_FILE))?;
        records.retain(|r| r.timestamp >= since);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use orchestrator_models::Address;
    use tempfile::tempdir;

    #[test]
    fn test_rejected_messages_are_kept() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());

        let message = Message::task(Address::external("cli"), "executor-1", "");
        let rejected = RejectedMessage {
            message,
            reason: "empty body".to_string(),
            rejected_at: Utc::now(),
        };
        audit.record_rejected(&rejected).unwrap();

        assert_eq!(audit.rejected().unwrap(), vec![rejected]);
        assert!(dir.path().join("logs/rejected.jsonl").exists());
    }

    #[test]
    fn test_communications_since_filters_old_records() {
        let dir = tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        let now = Utc::now();

        let mut old = Message::task(Address::external("cli"), "executor-1", "old");
        old.timestamp = now - Duration::days(10);
        let recent = Message::task(Address::external("cli"), "executor-1", "recent");

        audit
            .record_communication(&CommunicationRecord::from_message(&old, true))
            .unwrap();
        audit
            .record_communication(&CommunicationRecord::from_message(&recent, false))
            .unwrap();

        let records = audit.communications_since(now - Duration::days(7)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_id, recent.id);
        assert_eq!(records[0].from, "@cli");
        assert!(!records[0].delivered);
    }
}
