//! In-memory conversation state and cut-point computation.

use std::collections::{HashMap, HashSet};

use orchestrator_models::{Message, MessageId, MessageKind, WorkerId};

/// Ordered message history for one worker.
///
/// `messages[..summary_cursor]` is the compacted prefix: after the first
/// compaction it holds exactly one synthetic summary. Everything after the
/// cursor is raw history.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    worker_id: WorkerId,
    messages: Vec<Message>,
    summary_cursor: usize,
    /// Tracked messages that now live only in the summary.
    folded: Vec<(MessageId, MessageKind)>,
}

impl Conversation {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            messages: Vec::new(),
            summary_cursor: 0,
            folded: Vec::new(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn summary_cursor(&self) -> usize {
        self.summary_cursor
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of messages not yet compacted.
    pub fn raw_len(&self) -> usize {
        self.messages.len() - self.summary_cursor
    }

    /// Assignments and escalations folded into the summary.
    pub fn folded(&self) -> &[(MessageId, MessageKind)] {
        &self.folded
    }

    /// Returns the synthetic summary, if the conversation was compacted.
    pub fn summary(&self) -> Option<&Message> {
        self.messages[..self.summary_cursor].first()
    }

    /// Returns the last `limit` messages, oldest first.
    pub fn tail(&self, limit: Option<usize>) -> &[Message] {
        let skip = limit.map_or(0, |n| self.messages.len().saturating_sub(n));
        &self.messages[skip..]
    }

    /// Inserts a message keeping timestamps non-decreasing.
    ///
    /// Equal timestamps keep insertion order and nothing is ever placed
    /// inside the compacted prefix.
    pub(crate) fn push(&mut self, message: Message) {
        let raw = &self.messages[self.summary_cursor..];
        let pos = self.summary_cursor + raw.partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(pos, message);
    }

    /// Replaces the `replaced` messages with `summary` at the head.
    pub(crate) fn apply_compaction(&mut self, summary: Message, replaced: &[MessageId]) {
        let replaced: HashSet<&MessageId> = replaced.iter().collect();
        self.folded.extend(
            self.messages
                .iter()
                .filter(|m| m.is_tracked() && replaced.contains(&m.id))
                .map(|m| (m.id.clone(), m.kind)),
        );
        self.messages.retain(|m| !replaced.contains(&m.id));
        self.messages.insert(0, summary);
        self.summary_cursor = 1;
    }
}

/// Which tracked messages have been answered, across all conversations.
///
/// A completion usually lands in the assigner's conversation while the
/// assignment sits in the assignee's, so resolution is kept store-wide.
#[derive(Debug, Default)]
pub(crate) struct ReplyIndex {
    replies: HashMap<MessageId, Vec<MessageKind>>,
}

impl ReplyIndex {
    pub(crate) fn record(&mut self, message: &Message) {
        if let Some(target) = &message.in_reply_to {
            self.replies
                .entry(target.clone())
                .or_default()
                .push(message.kind);
        }
    }

    pub(crate) fn is_resolved(&self, message: &Message) -> bool {
        self.answered(&message.id, message.kind)
    }

    /// A task is resolved by a completion, an escalation by any reply.
    fn answered(&self, id: &MessageId, kind: MessageKind) -> bool {
        let Some(kinds) = self.replies.get(id) else {
            return false;
        };
        match kind {
            MessageKind::TaskAssignment => kinds.contains(&MessageKind::TaskCompletion),
            _ => !kinds.is_empty(),
        }
    }

    /// Ids of tracked messages in `messages` that are still open.
    pub(crate) fn open_ids(&self, messages: &[Message]) -> HashSet<MessageId> {
        messages
            .iter()
            .filter(|m| m.is_tracked() && !self.is_resolved(m))
            .map(|m| m.id.clone())
            .collect()
    }

    /// Ids of folded messages that are still open.
    pub(crate) fn open_folded(&self, folded: &[(MessageId, MessageKind)]) -> HashSet<MessageId> {
        folded
            .iter()
            .filter(|(id, kind)| !self.answered(id, *kind))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Largest cut `c` such that compacting `messages[..c]` keeps the last
/// `keep_recent` messages raw and splits no request/reply pair.
///
/// Returns `None` when no raw message can be compacted.
pub fn safe_cut(messages: &[Message], cursor: usize, keep_recent: usize) -> Option<usize> {
    let upper = messages.len().saturating_sub(keep_recent);
    narrow_cut(messages, cursor, upper)
}

/// Moves `cut` back until no reply at or after it answers a message before it.
pub(crate) fn narrow_cut(messages: &[Message], cursor: usize, mut cut: usize) -> Option<usize> {
    loop {
        if cut <= cursor {
            return None;
        }
        let positions: HashMap<&MessageId, usize> = messages[cursor..cut]
            .iter()
            .enumerate()
            .map(|(i, m)| (&m.id, cursor + i))
            .collect();

        let split = messages[cut..]
            .iter()
            .filter_map(|m| m.in_reply_to.as_ref())
            .filter_map(|id| positions.get(id).copied())
            .min();

        match split {
            Some(request) => cut = request,
            None => return Some(cut),
        }
    }
}
