//! MessageRouter - validates, records and delivers messages between workers.
//!
//! `send` runs these steps in order and stops at the first failure:
//!
//! 1. Validate the message shape (body, kind, reply target).
//! 2. Check the recipient exists in the worker table.
//! 3. Check the sender may address the recipient (hub-and-spoke routes).
//! 4. Append to the recipient's conversation.
//! 5. Type the formatted message into the recipient's window.
//!
//! Rejections in steps 1-3 are written to `logs/rejected.jsonl` and nothing
//! is appended. A failed delivery in step 5 does not undo step 4: the
//! message is queued and retried by [`MessageRouter::redeliver`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orchestrator_conversation::ConversationStore;
use orchestrator_models::{
    Address, Message, MessageId, MessageKind, Priority, Role, Worker, WorkerId, WorkerState,
};
use orchestrator_persistence::{AuditLog, CommunicationRecord, RejectedMessage};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result, ViolationReason};
use crate::event::RuntimeEvent;
use crate::supervisor::ProcessSupervisor;

/// What happened to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Typed into the recipient's window.
    Delivered,
    /// Recorded, waiting for the recipient to come back.
    Deferred(String),
}

/// Result of a successful `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: MessageId,
    pub recipient: WorkerId,
    pub delivery: Delivery,
}

impl Receipt {
    pub fn is_delivered(&self) -> bool {
        self.delivery == Delivery::Delivered
    }
}

/// Aggregated communication log statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommunicationStats {
    pub since: Option<DateTime<Utc>>,
    pub total: usize,
    pub delivered: usize,
    pub by_kind: BTreeMap<MessageKind, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    pub by_sender: BTreeMap<String, usize>,
    pub most_active: Option<(String, usize)>,
}

/// Returns true if a worker with role `sender` may message `recipient`.
///
/// Orchestrators and external callers reach everyone, everyone reaches the
/// orchestrator, and managers and executors only talk within their own team.
pub fn route_allowed(sender: &Worker, recipient: &Worker) -> bool {
    match (sender.role, recipient.role) {
        (Role::Orchestrator, _) | (_, Role::Orchestrator) => true,
        (Role::Manager, Role::Executor) => recipient.manager.as_ref() == Some(&sender.id),
        (Role::Executor, Role::Manager) => sender.manager.as_ref() == Some(&recipient.id),
        (Role::Manager, Role::Monitor) | (Role::Executor, Role::Monitor) => true,
        _ => false,
    }
}

/// Renders a message the way it is typed into a worker's window.
pub fn format_delivery(message: &Message) -> String {
    let mut text = format!(
        "[{}] {} from {} ({})\nTime: {}\n",
        message.priority.as_str().to_uppercase(),
        message.kind,
        message.from,
        message.id,
        message.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    );
    if let Some(reply_to) = &message.in_reply_to {
        text.push_str(&format!("Re: {}\n", reply_to));
    }
    text.push('\n');
    text.push_str(&message.body);
    text
}

/// Told about every message typed into a worker's window.
pub trait DeliveryObserver: Send + Sync {
    fn delivered(&self, worker_id: &WorkerId, text: &str);
}

/// Routes messages to supervised workers.
pub struct MessageRouter {
    supervisor: Arc<ProcessSupervisor>,
    conversations: Arc<ConversationStore>,
    audit: AuditLog,
    events: broadcast::Sender<RuntimeEvent>,
    max_body_len: usize,
    /// Serializes append + delivery per recipient.
    lanes: StdMutex<HashMap<WorkerId, Arc<Mutex<()>>>>,
    /// Accepted messages not yet typed into the recipient's window.
    deferred: StdMutex<HashMap<WorkerId, VecDeque<Message>>>,
    observer: OnceLock<Arc<dyn DeliveryObserver>>,
}

impl MessageRouter {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        conversations: Arc<ConversationStore>,
        audit: AuditLog,
        events: broadcast::Sender<RuntimeEvent>,
        max_body_len: usize,
    ) -> Self {
        Self {
            supervisor,
            conversations,
            audit,
            events,
            max_body_len,
            lanes: StdMutex::new(HashMap::new()),
            deferred: StdMutex::new(HashMap::new()),
            observer: OnceLock::new(),
        }
    }

    /// Registers the observer notified after each delivery. Only the first
    /// registration takes effect.
    pub fn observe_deliveries(&self, observer: Arc<dyn DeliveryObserver>) {
        if self.observer.set(observer).is_err() {
            warn!("delivery observer already registered");
        }
    }

    /// Drops the per-worker lane and delivery backlog of workers no longer
    /// in the table. Returns how many workers were forgotten.
    pub fn prune(&self) -> Result<usize> {
        let known: Vec<WorkerId> = self.supervisor.workers()?.into_iter().map(|w| w.id).collect();
        let mut forgotten = 0;
        for worker_id in self.tracked()? {
            if !known.contains(&worker_id) {
                self.forget(&worker_id)?;
                forgotten += 1;
            }
        }
        Ok(forgotten)
    }

    /// Drops a worker's lane and any messages still waiting for delivery.
    ///
    /// The messages stay in its conversation.
    pub fn forget(&self, worker_id: &WorkerId) -> Result<()> {
        self.lanes
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?
            .remove(worker_id);
        let dropped = self.with_deferred(|d| d.remove(worker_id).map_or(0, |q| q.len()))?;
        if dropped > 0 {
            debug!(worker_id = %worker_id, dropped, "dropped pending deliveries");
        }
        Ok(())
    }

    /// Workers that hold a lane or a delivery backlog.
    fn tracked(&self) -> Result<Vec<WorkerId>> {
        let mut ids: Vec<WorkerId> = self
            .lanes
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?
            .keys()
            .cloned()
            .collect();
        ids.extend(self.with_deferred(|d| d.keys().cloned().collect::<Vec<_>>())?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    fn lane(&self, worker_id: &WorkerId) -> Result<Arc<Mutex<()>>> {
        let mut lanes = self
            .lanes
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?;
        Ok(lanes.entry(worker_id.clone()).or_default().clone())
    }

    fn with_deferred<T>(&self, f: impl FnOnce(&mut HashMap<WorkerId, VecDeque<Message>>) -> T) -> Result<T> {
        let mut deferred = self
            .deferred
            .lock()
            .map_err(|e| OrchestratorError::LockPoisoned(e.to_string()))?;
        Ok(f(&mut deferred))
    }

    /// Validates, records and delivers one message.
    pub async fn send(&self, message: Message) -> Result<Receipt> {
        if let Err(reason) = self.validate(&message) {
            return Err(self.reject(message, reason));
        }

        let recipient = match self.supervisor.get(&message.to) {
            Ok(worker) => worker,
            Err(OrchestratorError::WorkerNotFound(id)) => {
                self.record_rejection(&message, &format!("unknown recipient {}", id));
                return Err(OrchestratorError::UnknownRecipient(id));
            }
            Err(e) => return Err(e),
        };

        if let Err(reason) = self.authorize(&message, &recipient) {
            return Err(self.reject(message, reason));
        }

        let receipt = self.accept(message.clone(), &recipient).await?;
        self.after_accept(&message).await;
        Ok(receipt)
    }

    /// Sends one `Broadcast` message to every non-stopped worker, optionally
    /// restricted to `role`. Only external callers and orchestrators may
    /// broadcast; the sender never receives its own broadcast.
    pub async fn broadcast(&self, from: Address, body: &str, role: Option<Role>) -> Result<Vec<Receipt>> {
        let template = Message::new(from.clone(), WorkerId::from("*"), MessageKind::Broadcast, body);
        if let Err(reason) = self.validate_body(body) {
            return Err(self.reject(template, reason));
        }
        if let Address::Worker(sender_id) = &from {
            match self.supervisor.get(sender_id) {
                Ok(sender) if sender.role == Role::Orchestrator => {}
                Ok(_) => return Err(self.reject(template, ViolationReason::UnauthorizedBroadcast)),
                Err(OrchestratorError::WorkerNotFound(id)) => {
                    return Err(self.reject(template, ViolationReason::UnknownSender(id)))
                }
                Err(e) => return Err(e),
            }
        }

        let targets: Vec<Worker> = self
            .supervisor
            .workers()?
            .into_iter()
            .filter(|w| w.state != WorkerState::Stopped)
            .filter(|w| role.map_or(true, |r| w.role == r))
            .filter(|w| from.worker_id() != Some(&w.id))
            .collect();

        let mut receipts = Vec::with_capacity(targets.len());
        for worker in &targets {
            let message = Message::new(from.clone(), worker.id.clone(), MessageKind::Broadcast, body);
            receipts.push(self.accept(message.clone(), worker).await?);
            self.after_accept(&message).await;
        }
        info!(from = %from, recipients = receipts.len(), "broadcast sent");
        Ok(receipts)
    }

    fn validate_body(&self, body: &str) -> std::result::Result<(), ViolationReason> {
        if body.trim().is_empty() {
            return Err(ViolationReason::EmptyBody);
        }
        if body.len() > self.max_body_len {
            return Err(ViolationReason::BodyTooLong {
                len: body.len(),
                max: self.max_body_len,
            });
        }
        Ok(())
    }

    fn validate(&self, message: &Message) -> std::result::Result<(), ViolationReason> {
        if message.synthetic {
            return Err(ViolationReason::SyntheticMessage);
        }
        self.validate_body(&message.body)?;
        match message.kind {
            MessageKind::Broadcast => Err(ViolationReason::BroadcastViaSend),
            MessageKind::TaskCompletion if message.in_reply_to.is_none() => {
                Err(ViolationReason::MissingReplyTarget)
            }
            _ => Ok(()),
        }
    }

    fn authorize(&self, message: &Message, recipient: &Worker) -> std::result::Result<(), ViolationReason> {
        let Address::Worker(sender_id) = &message.from else {
            return Ok(());
        };
        let sender = self
            .supervisor
            .get(sender_id)
            .map_err(|_| ViolationReason::UnknownSender(sender_id.clone()))?;
        if route_allowed(&sender, recipient) {
            Ok(())
        } else {
            Err(ViolationReason::UnauthorizedRoute {
                from: sender.role,
                to: recipient.role,
            })
        }
    }

    fn record_rejection(&self, message: &Message, reason: &str) {
        warn!(message_id = %message.id, from = %message.from, to = %message.to, reason = %reason, "message rejected");
        let rejected = RejectedMessage {
            message: message.clone(),
            reason: reason.to_string(),
            rejected_at: Utc::now(),
        };
        if let Err(e) = self.audit.record_rejected(&rejected) {
            warn!(error = %e, "failed to record rejected message");
        }
        self.emit(RuntimeEvent::MessageRejected {
            message_id: message.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn reject(&self, message: Message, reason: ViolationReason) -> OrchestratorError {
        self.record_rejection(&message, &reason.to_string());
        OrchestratorError::ProtocolViolation(reason)
    }

    /// Appends and delivers under the recipient's lane.
    async fn accept(&self, message: Message, recipient: &Worker) -> Result<Receipt> {
        let lane = self.lane(&recipient.id)?;
        let _guard = lane.lock().await;

        self.conversations.append(&recipient.id, message.clone()).await?;

        // Earlier deferred messages go first to keep window order.
        let backlog = self.flush(recipient).await?;
        let delivery = if backlog > 0 {
            self.defer(&message, "earlier messages still pending".to_string())?
        } else {
            match self.deliver(recipient, &message).await {
                Ok(()) => Delivery::Delivered,
                Err(e) => self.defer(&message, e.to_string())?,
            }
        };

        if let Address::Worker(sender_id) = &message.from {
            // A message from a worker is evidence that it is alive.
            if let Err(e) = self.supervisor.record_activity(sender_id, Utc::now()) {
                debug!(worker_id = %sender_id, error = %e, "could not record sender activity");
            }
        }

        let record = CommunicationRecord::from_message(&message, delivery == Delivery::Delivered);
        if let Err(e) = self.audit.record_communication(&record) {
            warn!(error = %e, "failed to record communication");
        }

        Ok(Receipt {
            message_id: message.id,
            recipient: recipient.id.clone(),
            delivery,
        })
    }

    /// Compacts the recipient's conversation once it crosses its budget.
    async fn after_accept(&self, message: &Message) {
        match self.conversations.needs_summary(&message.to).await {
            Ok(true) => {
                if let Err(e) = self.conversations.summarize(&message.to).await {
                    warn!(worker_id = %message.to, error = %e, "conversation compaction failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(worker_id = %message.to, error = %e, "could not check conversation budget"),
        }
    }

    async fn deliver(&self, recipient: &Worker, message: &Message) -> Result<()> {
        // Re-read: the worker may have been restarted into another window.
        let current = self.supervisor.get(&recipient.id)?;
        if current.state == WorkerState::Stopped {
            return Err(OrchestratorError::InvalidState(format!("{} is stopped", current.id)));
        }
        let text = format_delivery(message);
        self.supervisor
            .backend()
            .send_input(&current.session, current.window, &text)
            .await?;
        if let Some(observer) = self.observer.get() {
            observer.delivered(&current.id, &text);
        }

        debug!(message_id = %message.id, worker_id = %current.id, kind = %message.kind, "message delivered");
        self.emit(RuntimeEvent::MessageDelivered {
            message_id: message.id.clone(),
            worker_id: current.id.clone(),
        });
        Ok(())
    }

    fn defer(&self, message: &Message, reason: String) -> Result<Delivery> {
        warn!(message_id = %message.id, worker_id = %message.to, reason = %reason, "delivery deferred");
        self.with_deferred(|d| d.entry(message.to.clone()).or_default().push_back(message.clone()))?;
        self.emit(RuntimeEvent::MessageDeferred {
            message_id: message.id.clone(),
            worker_id: message.to.clone(),
            reason: reason.clone(),
        });
        Ok(Delivery::Deferred(reason))
    }

    /// Delivers queued messages in order until one fails.
    ///
    /// Returns how many are still queued. Caller holds the lane.
    async fn flush(&self, recipient: &Worker) -> Result<usize> {
        loop {
            let next = self.with_deferred(|d| d.get(&recipient.id).and_then(|q| q.front().cloned()))?;
            let Some(message) = next else {
                return Ok(0);
            };
            if let Err(e) = self.deliver(recipient, &message).await {
                debug!(worker_id = %recipient.id, error = %e, "redelivery failed");
                return self.with_deferred(|d| d.get(&recipient.id).map_or(0, VecDeque::len));
            }
            self.with_deferred(|d| {
                if let Some(queue) = d.get_mut(&recipient.id) {
                    queue.pop_front();
                    if queue.is_empty() {
                        d.remove(&recipient.id);
                    }
                }
            })?;
        }
    }

    /// Retries deferred deliveries for a worker. Returns how many went out.
    pub async fn redeliver(&self, worker_id: &WorkerId) -> Result<usize> {
        let before = self.pending_deliveries(worker_id)?.len();
        if before == 0 {
            return Ok(0);
        }
        let worker = self.supervisor.get(worker_id)?;
        let lane = self.lane(worker_id)?;
        let _guard = lane.lock().await;

        let remaining = self.flush(&worker).await?;
        let delivered = before.saturating_sub(remaining);
        if delivered > 0 {
            info!(worker_id = %worker_id, delivered, remaining, "redelivered deferred messages");
        }
        Ok(delivered)
    }

    /// Ids of messages accepted for `worker_id` but not yet delivered.
    pub fn pending_deliveries(&self, worker_id: &WorkerId) -> Result<Vec<MessageId>> {
        self.with_deferred(|d| {
            d.get(worker_id)
                .map(|q| q.iter().map(|m| m.id.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Summarizes the communication log over the last `days` days.
    pub fn stats(&self, days: u32, now: DateTime<Utc>) -> Result<CommunicationStats> {
        let since = now - ChronoDuration::days(i64::from(days));
        let records = self.audit.communications_since(since)?;

        let mut stats = CommunicationStats {
            since: Some(since),
            total: records.len(),
            ..Default::default()
        };
        for record in &records {
            if record.delivered {
                stats.delivered += 1;
            }
            *stats.by_kind.entry(record.kind).or_default() += 1;
            *stats.by_priority.entry(record.priority).or_default() += 1;
            *stats.by_sender.entry(record.from.clone()).or_default() += 1;
        }
        stats.most_active = stats
            .by_sender
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(sender, count)| (sender.clone(), *count));
        Ok(stats)
    }

    /// Messages the router refused, oldest first.
    pub fn rejected(&self) -> Result<Vec<RejectedMessage>> {
        Ok(self.audit.rejected()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use orchestrator_conversation::{Budget, ExtractiveSummarizer};
    use orchestrator_persistence::StateStore;
    use orchestrator_tmux::MemoryBackend;
    use tempfile::{tempdir, TempDir};

    use crate::backend::TimedBackend;
    use crate::supervisor::SpawnOptions;

    struct Fixture {
        _dir: TempDir,
        memory: Arc<MemoryBackend>,
        supervisor: Arc<ProcessSupervisor>,
        conversations: Arc<ConversationStore>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let memory = Arc::new(MemoryBackend::new());
        let (tx, _) = broadcast::channel(64);
        let backend = TimedBackend::new(memory.clone(), Duration::from_secs(1));
        let supervisor = Arc::new(
            ProcessSupervisor::open(backend, StateStore::new(dir.path()), HashMap::new(), tx.clone()).unwrap(),
        );
        let conversations = Arc::new(ConversationStore::in_memory(
            Budget::default(),
            Arc::new(ExtractiveSummarizer),
        ));
        let router = MessageRouter::new(
            supervisor.clone(),
            conversations.clone(),
            AuditLog::new(dir.path()),
            tx,
            256,
        );
        Fixture {
            _dir: dir,
            memory,
            supervisor,
            conversations,
            router,
        }
    }

    async fn spawn(f: &Fixture, role: Role, manager: Option<&WorkerId>) -> Worker {
        f.supervisor
            .spawn(
                role,
                "proj",
                SpawnOptions {
                    manager: manager.cloned(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_records_and_delivers() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;

        let msg = Message::task(Address::external("cli"), w.id.clone(), "implement X");
        let receipt = f.router.send(msg.clone()).await.unwrap();

        assert!(receipt.is_delivered());
        let history = f.conversations.history(&w.id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, MessageKind::TaskAssignment);

        let typed = f.memory.sent_input("proj", w.window);
        assert_eq!(typed.len(), 1);
        assert!(typed[0].starts_with(&format!("[HIGH] task_assignment from @cli ({})", msg.id)));
        assert!(typed[0].ends_with("\n\nimplement X"));
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_recorded() {
        let f = fixture();
        let msg = Message::task(Address::external("cli"), "executor-missing", "implement X");

        let result = f.router.send(msg).await;
        assert!(matches!(result, Err(OrchestratorError::UnknownRecipient(_))));
        assert_eq!(f.router.rejected().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_before_append() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        let cli = Address::external("cli");

        let cases = vec![
            (Message::task(cli.clone(), w.id.clone(), "   "), ViolationReason::EmptyBody),
            (
                Message::task(cli.clone(), w.id.clone(), "x".repeat(300)),
                ViolationReason::BodyTooLong { len: 300, max: 256 },
            ),
            (
                Message::new(cli.clone(), w.id.clone(), MessageKind::Broadcast, "hi"),
                ViolationReason::BroadcastViaSend,
            ),
            (
                Message::new(cli.clone(), w.id.clone(), MessageKind::TaskCompletion, "done"),
                ViolationReason::MissingReplyTarget,
            ),
            (
                Message::summary(w.id.clone(), "summary", Utc::now()),
                ViolationReason::SyntheticMessage,
            ),
        ];

        for (msg, expected) in cases {
            let result = f.router.send(msg).await;
            assert!(
                matches!(&result, Err(OrchestratorError::ProtocolViolation(r)) if *r == expected),
                "expected {:?}, got {:?}",
                expected,
                result
            );
        }
        assert!(f.conversations.history(&w.id, None).await.unwrap().is_empty());
        assert_eq!(f.router.rejected().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_route_table() {
        let f = fixture();
        let orch = spawn(&f, Role::Orchestrator, None).await;
        let pm = spawn(&f, Role::Manager, None).await;
        let other_pm = spawn(&f, Role::Manager, None).await;
        let dev = spawn(&f, Role::Executor, Some(&pm.id)).await;
        let other_dev = spawn(&f, Role::Executor, Some(&other_pm.id)).await;
        let mon = spawn(&f, Role::Monitor, None).await;

        let allowed = [
            (&orch, &dev),
            (&pm, &dev),
            (&dev, &pm),
            (&dev, &orch),
            (&mon, &orch),
            (&pm, &mon),
            (&dev, &mon),
        ];
        for (from, to) in allowed {
            assert!(route_allowed(from, to), "{} -> {}", from.id, to.id);
        }

        let denied = [
            (&dev, &other_dev),
            (&pm, &other_dev),
            (&other_dev, &pm),
            (&pm, &other_pm),
            (&mon, &dev),
            (&mon, &pm),
        ];
        for (from, to) in denied {
            assert!(!route_allowed(from, to), "{} -> {}", from.id, to.id);
        }
    }

    #[tokio::test]
    async fn test_executor_to_executor_is_rejected() {
        let f = fixture();
        let a = spawn(&f, Role::Executor, None).await;
        let b = spawn(&f, Role::Executor, None).await;

        let msg = Message::new(a.id.clone(), b.id.clone(), MessageKind::Coordination, "hi");
        let result = f.router.send(msg).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::ProtocolViolation(ViolationReason::UnauthorizedRoute {
                from: Role::Executor,
                to: Role::Executor
            }))
        ));
        assert!(f.conversations.history(&b.id, None).await.unwrap().is_empty());
        assert!(f.memory.sent_input("proj", b.window).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sender_rejected() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        let msg = Message::new(WorkerId::from("ghost"), w.id.clone(), MessageKind::Coordination, "hi");

        let result = f.router.send(msg).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ProtocolViolation(ViolationReason::UnknownSender(_)))
        ));
    }

    #[tokio::test]
    async fn test_failed_delivery_is_recorded_and_redelivered_in_order() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        let cli = Address::external("cli");

        f.memory.set_unavailable(true);
        let first = f.router.send(Message::task(cli.clone(), w.id.clone(), "one")).await.unwrap();
        assert!(matches!(first.delivery, Delivery::Deferred(_)));
        f.memory.set_unavailable(false);

        // second send sees the backlog and queues behind it
        let second = f.router.send(Message::task(cli.clone(), w.id.clone(), "two")).await.unwrap();
        assert!(second.is_delivered());

        let typed = f.memory.sent_input("proj", w.window);
        assert_eq!(typed.len(), 2);
        assert!(typed[0].ends_with("one"));
        assert!(typed[1].ends_with("two"));
        assert!(f.router.pending_deliveries(&w.id).unwrap().is_empty());
        assert_eq!(f.conversations.history(&w.id, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stopped_recipient_defers_until_redeliver() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        f.supervisor.terminate(&w.id).await.unwrap();

        let receipt = f
            .router
            .send(Message::task(Address::external("cli"), w.id.clone(), "later"))
            .await
            .unwrap();
        assert!(!receipt.is_delivered());
        assert_eq!(f.router.pending_deliveries(&w.id).unwrap(), vec![receipt.message_id.clone()]);

        let restarted = f.supervisor.restart(&w.id).await.unwrap();
        assert_eq!(f.router.redeliver(&w.id).await.unwrap(), 1);
        let typed = f.memory.sent_input("proj", restarted.window);
        assert!(typed.iter().any(|t| t.ends_with("later")));
    }

    #[tokio::test]
    async fn test_prune_drops_state_of_removed_workers() {
        let f = fixture();
        let kept = spawn(&f, Role::Executor, None).await;
        let gone = spawn(&f, Role::Executor, None).await;
        let cli = Address::external("cli");

        f.router.send(Message::task(cli.clone(), kept.id.clone(), "stay")).await.unwrap();
        f.supervisor.terminate(&gone.id).await.unwrap();
        f.router.send(Message::task(cli.clone(), gone.id.clone(), "never typed")).await.unwrap();
        assert_eq!(f.router.pending_deliveries(&gone.id).unwrap().len(), 1);

        f.supervisor.archive(&gone.id).await.unwrap();
        assert_eq!(f.router.prune().unwrap(), 1);
        assert_eq!(f.router.tracked().unwrap(), vec![kept.id.clone()]);
        assert!(f.router.pending_deliveries(&gone.id).unwrap().is_empty());
        assert_eq!(f.conversations.history(&gone.id, None).await.unwrap().len(), 1);
        assert_eq!(f.router.prune().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_observer_sees_typed_text() {
        struct Recorder(StdMutex<Vec<(WorkerId, String)>>);

        impl DeliveryObserver for Recorder {
            fn delivered(&self, worker_id: &WorkerId, text: &str) {
                self.0.lock().unwrap().push((worker_id.clone(), text.to_string()));
            }
        }

        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        f.router.observe_deliveries(recorder.clone());

        f.memory.set_unavailable(true);
        f.router.send(Message::task(Address::external("cli"), w.id.clone(), "one")).await.unwrap();
        assert!(recorder.0.lock().unwrap().is_empty());
        f.memory.set_unavailable(false);
        f.router.redeliver(&w.id).await.unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen, vec![(w.id.clone(), f.memory.sent_input("proj", w.window)[0].clone())]);
    }

    #[tokio::test]
    async fn test_sender_activity_counts_as_heartbeat() {
        let f = fixture();
        let pm = spawn(&f, Role::Manager, None).await;
        let dev = spawn(&f, Role::Executor, Some(&pm.id)).await;
        f.supervisor.mark_unresponsive(&dev.id).unwrap();

        let assignment = Message::task(pm.id.clone(), dev.id.clone(), "implement X");
        f.router.send(assignment.clone()).await.unwrap();
        f.router
            .send(Message::completion(dev.id.clone(), pm.id.clone(), &assignment.id, "done"))
            .await
            .unwrap();

        let dev = f.supervisor.get(&dev.id).unwrap();
        assert_eq!(dev.state, WorkerState::Running);
        assert!(f.conversations.outstanding(&dev.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordering_per_worker() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        let cli = Address::external("cli");

        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = Message::new(cli.clone(), w.id.clone(), MessageKind::Coordination, format!("m{}", i));
            ids.push(f.router.send(msg).await.unwrap().message_id);
        }
        let history: Vec<MessageId> = f
            .conversations
            .history(&w.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(history, ids);
    }

    #[tokio::test]
    async fn test_broadcast_permissions_and_fanout() {
        let f = fixture();
        let orch = spawn(&f, Role::Orchestrator, None).await;
        let a = spawn(&f, Role::Executor, None).await;
        let b = spawn(&f, Role::Executor, None).await;
        let pm = spawn(&f, Role::Manager, None).await;
        f.supervisor.terminate(&b.id).await.unwrap();

        let receipts = f
            .router
            .broadcast(orch.id.clone().into(), "standup", None)
            .await
            .unwrap();
        let mut recipients: Vec<WorkerId> = receipts.into_iter().map(|r| r.recipient).collect();
        recipients.sort();
        let mut expected = vec![a.id.clone(), pm.id.clone()];
        expected.sort();
        assert_eq!(recipients, expected);

        let only_execs = f
            .router
            .broadcast(Address::external("cli"), "freeze", Some(Role::Executor))
            .await
            .unwrap();
        assert_eq!(only_execs.len(), 1);

        let denied = f.router.broadcast(a.id.clone().into(), "hi all", None).await;
        assert!(matches!(
            denied,
            Err(OrchestratorError::ProtocolViolation(ViolationReason::UnauthorizedBroadcast))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let f = fixture();
        let w = spawn(&f, Role::Executor, None).await;
        let cli = Address::external("cli");
        f.router.send(Message::task(cli.clone(), w.id.clone(), "a")).await.unwrap();
        f.router.send(Message::task(cli.clone(), w.id.clone(), "b")).await.unwrap();
        f.router
            .send(Message::new(Address::external("ops"), w.id.clone(), MessageKind::StatusRequest, "?"))
            .await
            .unwrap();

        let stats = f.router.stats(7, Utc::now()).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.by_kind[&MessageKind::TaskAssignment], 2);
        assert_eq!(stats.by_priority[&Priority::High], 2);
        assert_eq!(stats.most_active, Some(("@cli".to_string(), 2)));

        let future = f.router.stats(1, Utc::now() + ChronoDuration::days(3)).unwrap();
        assert_eq!(future.total, 0);
    }

    #[test]
    fn test_format_delivery_with_reply() {
        let task = Message::task(Address::external("cli"), "executor-1", "implement X");
        let done = Message::completion(WorkerId::from("executor-1"), "manager-1", &task.id, "done");

        let text = format_delivery(&done);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("[MEDIUM] task_completion from executor-1 ({})", done.id));
        assert!(lines[1].starts_with("Time: "));
        assert_eq!(lines[2], format!("Re: {}", task.id));
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], "done");
    }
}
