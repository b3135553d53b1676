//! ConversationStore - per-worker append-only histories with compaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use orchestrator_models::{Message, MessageId, WorkerId};
use orchestrator_persistence::{ConversationLog, LogEntry};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::conversation::{narrow_cut, safe_cut, Conversation, ReplyIndex};
use crate::error::{ConversationError, Result};
use crate::summarizer::Summarizer;

/// Default number of raw messages kept before compaction kicks in.
pub const DEFAULT_MESSAGE_BUDGET: usize = 50;

/// Default estimated-token budget.
pub const DEFAULT_TOKEN_BUDGET: usize = 8000;

/// Default number of most recent messages kept verbatim.
pub const DEFAULT_KEEP_RECENT: usize = 10;

/// Compaction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Compact once more than this many raw messages accumulate.
    pub messages: usize,
    /// Compact once the estimated token count exceeds this.
    pub tokens: usize,
    /// Messages at the tail that are never compacted.
    pub keep_recent: usize,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            messages: DEFAULT_MESSAGE_BUDGET,
            tokens: DEFAULT_TOKEN_BUDGET,
            keep_recent: DEFAULT_KEEP_RECENT,
        }
    }
}

/// Result of a successful compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Compaction {
    /// The synthetic summary now at the head of the conversation.
    pub summary_id: MessageId,
    /// How many messages (including any earlier summary) it replaced.
    pub replaced: usize,
    /// Cuts rejected because the summary omitted an open message.
    pub retries: usize,
}

/// Thread-safe store of every worker's conversation.
///
/// # Concurrency
///
/// - The map of conversations sits behind a std `RwLock` that is never held
///   across an await.
/// - Each conversation has its own tokio `Mutex`, so appends to one worker
///   are serialized (and may wait on a running summarizer) while other
///   workers proceed independently.
///
/// With a backing [`ConversationLog`], each append is written to disk before
/// it becomes visible in memory.
pub struct ConversationStore {
    log: Option<ConversationLog>,
    budget: Budget,
    summarizer: Arc<dyn Summarizer>,
    conversations: RwLock<HashMap<WorkerId, Arc<Mutex<Conversation>>>>,
    replies: RwLock<ReplyIndex>,
}

impl ConversationStore {
    /// Creates a store that keeps everything in memory.
    pub fn in_memory(budget: Budget, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            log: None,
            budget,
            summarizer,
            conversations: RwLock::new(HashMap::new()),
            replies: RwLock::new(ReplyIndex::default()),
        }
    }

    /// Opens the store under `root`, replaying every conversation log found.
    pub fn open(root: impl AsRef<Path>, budget: Budget, summarizer: Arc<dyn Summarizer>) -> Result<Self> {
        let log = ConversationLog::new(root);
        let mut conversations = HashMap::new();
        let mut replies = ReplyIndex::default();

        for worker_id in log.workers()? {
            let mut convo = Conversation::new(worker_id.clone());
            for entry in log.load(&worker_id)? {
                match entry {
                    LogEntry::Message { message } => {
                        replies.record(&message);
                        convo.push(message);
                    }
                    LogEntry::Compaction { summary, replaced } => {
                        convo.apply_compaction(summary, &replaced);
                    }
                }
            }
            debug!(worker_id = %worker_id, messages = convo.len(), "replayed conversation");
            conversations.insert(worker_id, Arc::new(Mutex::new(convo)));
        }

        Ok(Self {
            log: Some(log),
            budget,
            summarizer,
            conversations: RwLock::new(conversations),
            replies: RwLock::new(replies),
        })
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    fn conversation(&self, worker_id: &WorkerId) -> Result<Arc<Mutex<Conversation>>> {
        if let Some(convo) = self
            .conversations
            .read()
            .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?
            .get(worker_id)
        {
            return Ok(convo.clone());
        }

        let mut map = self
            .conversations
            .write()
            .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?;
        Ok(map
            .entry(worker_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Conversation::new(worker_id.clone()))))
            .clone())
    }

    fn existing(&self, worker_id: &WorkerId) -> Result<Option<Arc<Mutex<Conversation>>>> {
        Ok(self
            .conversations
            .read()
            .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?
            .get(worker_id)
            .cloned())
    }

    /// Appends a message to a worker's conversation.
    ///
    /// Returns the new length of the conversation.
    pub async fn append(&self, worker_id: &WorkerId, message: Message) -> Result<usize> {
        let convo = self.conversation(worker_id)?;
        let mut convo = convo.lock().await;

        if let Some(log) = &self.log {
            log.append(
                worker_id,
                &LogEntry::Message {
                    message: message.clone(),
                },
            )?;
        }

        self.replies
            .write()
            .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?
            .record(&message);
        convo.push(message);
        Ok(convo.len())
    }

    /// Returns the last `limit` messages (all when `None`), oldest first.
    pub async fn history(&self, worker_id: &WorkerId, limit: Option<usize>) -> Result<Vec<Message>> {
        match self.existing(worker_id)? {
            Some(convo) => Ok(convo.lock().await.tail(limit).to_vec()),
            None => Ok(Vec::new()),
        }
    }

    /// Returns a copy of a worker's conversation.
    pub async fn snapshot(&self, worker_id: &WorkerId) -> Result<Conversation> {
        match self.existing(worker_id)? {
            Some(convo) => Ok(convo.lock().await.clone()),
            None => Ok(Conversation::new(worker_id.clone())),
        }
    }

    /// Assignments and escalations in a worker's conversation still awaiting a reply.
    pub async fn outstanding(&self, worker_id: &WorkerId) -> Result<Vec<Message>> {
        let Some(convo) = self.existing(worker_id)? else {
            return Ok(Vec::new());
        };
        let convo = convo.lock().await;
        let replies = self
            .replies
            .read()
            .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?;
        Ok(convo
            .messages()
            .iter()
            .filter(|m| m.is_tracked() && !replies.is_resolved(m))
            .cloned()
            .collect())
    }

    /// Workers that have a conversation.
    pub fn workers(&self) -> Result<Vec<WorkerId>> {
        let mut ids: Vec<WorkerId> = self
            .conversations
            .read()
            .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn exceeds_budget(&self, convo: &Conversation) -> bool {
        if convo.raw_len() > self.budget.messages {
            return true;
        }
        let tokens: usize = convo
            .messages()
            .iter()
            .map(|m| self.summarizer.estimate_tokens(&m.body))
            .sum();
        tokens > self.budget.tokens
    }

    /// Reports whether a worker's conversation is over budget.
    pub async fn needs_summary(&self, worker_id: &WorkerId) -> Result<bool> {
        match self.existing(worker_id)? {
            Some(convo) => Ok(self.exceeds_budget(&*convo.lock().await)),
            None => Ok(false),
        }
    }

    /// Compacts a worker's conversation if it is over budget.
    ///
    /// Returns `None` when under budget or when nothing outside the
    /// keep-recent window can be cut.
    pub async fn summarize(&self, worker_id: &WorkerId) -> Result<Option<Compaction>> {
        self.compact_inner(worker_id, false).await
    }

    /// Compacts a worker's conversation regardless of budget.
    pub async fn compact(&self, worker_id: &WorkerId) -> Result<Option<Compaction>> {
        self.compact_inner(worker_id, true).await
    }

    async fn compact_inner(&self, worker_id: &WorkerId, force: bool) -> Result<Option<Compaction>> {
        let Some(convo) = self.existing(worker_id)? else {
            return Ok(None);
        };
        let mut convo = convo.lock().await;

        if !force && !self.exceeds_budget(&convo) {
            return Ok(None);
        }

        let cursor = convo.summary_cursor();
        let Some(mut cut) = safe_cut(convo.messages(), cursor, self.budget.keep_recent) else {
            debug!(worker_id = %worker_id, "nothing to compact outside keep-recent window");
            return Ok(None);
        };

        let mut retries = 0;
        loop {
            let range = &convo.messages()[..cut];
            let open = {
                let replies = self
                    .replies
                    .read()
                    .map_err(|e| ConversationError::LockPoisoned(e.to_string()))?;
                let mut open = replies.open_ids(range);
                open.extend(replies.open_folded(convo.folded()));
                open
            };

            let text = self.summarizer.summarize(range, &open).await?;

            // Every open item in the cut must survive by id.
            let omitted = range[cursor..]
                .iter()
                .position(|m| open.contains(&m.id) && !text.contains(m.id.as_str()));

            let Some(offset) = omitted else {
                let replaced: Vec<MessageId> = range.iter().map(|m| m.id.clone()).collect();
                let timestamp = range[range.len() - 1].timestamp;
                let summary = Message::summary(worker_id.clone(), text, timestamp);
                let summary_id = summary.id.clone();

                if let Some(log) = &self.log {
                    log.append(
                        worker_id,
                        &LogEntry::Compaction {
                            summary: summary.clone(),
                            replaced: replaced.clone(),
                        },
                    )?;
                }
                convo.apply_compaction(summary, &replaced);

                info!(
                    worker_id = %worker_id,
                    replaced = replaced.len(),
                    retries,
                    "conversation compacted"
                );
                return Ok(Some(Compaction {
                    summary_id,
                    replaced: replaced.len(),
                    retries,
                }));
            };

            let omitted_at = cursor + offset;
            let message_id = convo.messages()[omitted_at].id.clone();
            warn!(
                worker_id = %worker_id,
                message_id = %message_id,
                "summary omitted open message, retrying with smaller cut"
            );
            retries += 1;
            cut = match narrow_cut(convo.messages(), cursor, omitted_at) {
                Some(c) => c,
                None => {
                    return Err(ConversationError::SummarizationConflict {
                        worker_id: worker_id.clone(),
                        message_id,
                    })
                }
            };
        }
    }
}
