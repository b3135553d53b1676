//! Structured inter-worker messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, WorkerId};

/// Error returned when parsing one of the model enums from a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }

    /// Name of the enum that failed to parse.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The rejected input.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Ask a worker for its status.
    StatusRequest,
    /// Answer to a status request.
    StatusResponse,
    /// Hand a task to a worker.
    TaskAssignment,
    /// Report that an assigned task is done. Must reply to the assignment.
    TaskCompletion,
    /// General coordination; also used for check-ins and summaries.
    Coordination,
    /// Raise an issue up the hierarchy.
    Escalation,
    /// Fan-out announcement.
    Broadcast,
}

impl MessageKind {
    /// All message kinds.
    pub const ALL: [MessageKind; 7] = [
        MessageKind::StatusRequest,
        MessageKind::StatusResponse,
        MessageKind::TaskAssignment,
        MessageKind::TaskCompletion,
        MessageKind::Coordination,
        MessageKind::Escalation,
        MessageKind::Broadcast,
    ];

    /// Returns the canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::StatusRequest => "status_request",
            MessageKind::StatusResponse => "status_response",
            MessageKind::TaskAssignment => "task_assignment",
            MessageKind::TaskCompletion => "task_completion",
            MessageKind::Coordination => "coordination",
            MessageKind::Escalation => "escalation",
            MessageKind::Broadcast => "broadcast",
        }
    }

    /// Default priority for this kind when the caller does not choose one.
    pub fn default_priority(&self) -> Priority {
        match self {
            MessageKind::Escalation => Priority::Urgent,
            MessageKind::TaskAssignment | MessageKind::Coordination => Priority::High,
            _ => Priority::Medium,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized || k.as_str().replace('_', "") == normalized)
            .ok_or_else(|| ParseEnumError::new("message kind", s))
    }
}

/// Message priority. Ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" | "critical" => Ok(Priority::Urgent),
            _ => Err(ParseEnumError::new("priority", s)),
        }
    }
}

/// Sender of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    /// A supervised worker.
    Worker(WorkerId),
    /// A caller outside the worker table (CLI user, scheduler, health monitor).
    External(String),
}

impl Address {
    /// Shorthand for an external caller.
    pub fn external(name: impl Into<String>) -> Self {
        Address::External(name.into())
    }

    /// Returns the worker id if this address names a worker.
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            Address::Worker(id) => Some(id),
            Address::External(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Worker(id) => write!(f, "{}", id),
            Address::External(name) => write!(f, "@{}", name),
        }
    }
}

impl From<WorkerId> for Address {
    fn from(id: WorkerId) -> Self {
        Address::Worker(id)
    }
}

/// An immutable message addressed to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub id: MessageId,

    /// Sender.
    pub from: Address,

    /// Recipient worker.
    pub to: WorkerId,

    /// Message kind.
    pub kind: MessageKind,

    /// Priority.
    pub priority: Priority,

    /// Text body.
    pub body: String,

    /// Message this one answers, forming a request/response pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,

    /// True for summaries produced by conversation compaction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic: bool,

    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message with the kind's default priority.
    pub fn new(
        from: impl Into<Address>,
        to: impl Into<WorkerId>,
        kind: MessageKind,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            from: from.into(),
            to: to.into(),
            kind,
            priority: kind.default_priority(),
            body: body.into(),
            in_reply_to: None,
            synthetic: false,
            timestamp: Utc::now(),
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Marks this message as a reply.
    pub fn in_reply_to(mut self, id: MessageId) -> Self {
        self.in_reply_to = Some(id);
        self
    }

    /// Creates a task assignment.
    pub fn task(from: impl Into<Address>, to: impl Into<WorkerId>, body: impl Into<String>) -> Self {
        Self::new(from, to, MessageKind::TaskAssignment, body)
    }

    /// Creates a completion reply for an assignment.
    pub fn completion(
        from: impl Into<Address>,
        to: impl Into<WorkerId>,
        assignment: &MessageId,
        body: impl Into<String>,
    ) -> Self {
        Self::new(from, to, MessageKind::TaskCompletion, body).in_reply_to(assignment.clone())
    }

    /// Creates an escalation.
    pub fn escalation(
        from: impl Into<Address>,
        to: impl Into<WorkerId>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(from, to, MessageKind::Escalation, body)
    }

    /// Creates a synthetic compaction summary.
    pub fn summary(to: impl Into<WorkerId>, body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        let mut msg = Self::new(
            Address::external("summary"),
            to,
            MessageKind::Coordination,
            body,
        );
        msg.priority = Priority::Low;
        msg.synthetic = true;
        msg.timestamp = timestamp;
        msg
    }

    /// Returns true for kinds that stay open until answered.
    pub fn is_tracked(&self) -> bool {
        !self.synthetic
            && matches!(
                self.kind,
                MessageKind::TaskAssignment | MessageKind::Escalation
            )
    }
}
