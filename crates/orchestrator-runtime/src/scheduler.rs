//! Check-in scheduler.
//!
//! Pending check-ins sit in a min-heap keyed by `fire_at` (ties in insertion
//! order) and are mirrored to `state/schedule.json`. Every operation first
//! reloads that file, so check-ins added by a one-shot CLI call are picked up
//! by a running loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orchestrator_models::{Address, CheckInId, Message, MessageId, MessageKind, ScheduledCheckIn, WorkerId};
use orchestrator_persistence::StateStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result, ViolationReason};
use crate::event::RuntimeEvent;
use crate::router::MessageRouter;
use crate::supervisor::ProcessSupervisor;

/// Sender name used for check-in messages.
pub const SCHEDULER_SENDER: &str = "scheduler";

/// A heap entry. Ordered so that `BinaryHeap` pops the earliest first.
#[derive(Debug, Clone)]
struct Pending {
    check_in: ScheduledCheckIn,
    seq: u64,
}

impl Pending {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.check_in.fire_at, self.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: earliest fire_at is the greatest element.
        other.key().cmp(&self.key())
    }
}

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Pending>,
    next_seq: u64,
}

impl Queue {
    fn push(&mut self, check_in: ScheduledCheckIn) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Pending { check_in, seq });
    }

    fn sorted(&self) -> Vec<ScheduledCheckIn> {
        let mut entries: Vec<&Pending> = self.heap.iter().collect();
        entries.sort_by_key(|p| p.key());
        entries.into_iter().map(|p| p.check_in.clone()).collect()
    }

    fn replace(&mut self, check_ins: Vec<ScheduledCheckIn>) {
        self.heap.clear();
        for check_in in check_ins {
            self.push(check_in);
        }
    }
}

/// A check-in that fired during a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredCheckIn {
    pub check_in_id: CheckInId,
    pub worker_id: WorkerId,
    pub message_id: MessageId,
    /// True if a next occurrence was queued.
    pub rescheduled: bool,
}

/// Outcome of [`Scheduler::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub fired: Vec<FiredCheckIn>,
    /// Check-ins removed because the router refused them.
    pub dropped: Vec<CheckInId>,
}

/// Fires scheduled check-ins through the router.
pub struct Scheduler {
    supervisor: Arc<ProcessSupervisor>,
    router: Arc<MessageRouter>,
    store: StateStore,
    events: broadcast::Sender<RuntimeEvent>,
    queue: Mutex<Queue>,
}

impl Scheduler {
    pub fn open(
        supervisor: Arc<ProcessSupervisor>,
        router: Arc<MessageRouter>,
        store: StateStore,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> Result<Self> {
        let mut queue = Queue::default();
        queue.replace(store.load_schedule()?);
        Ok(Self {
            supervisor,
            router,
            store,
            events,
            queue: Mutex::new(queue),
        })
    }

    fn reload(&self, queue: &mut Queue) -> Result<()> {
        queue.replace(self.store.load_schedule()?);
        Ok(())
    }

    fn save(&self, queue: &Queue) -> Result<()> {
        self.store.save_schedule(&queue.sorted())?;
        Ok(())
    }

    /// Queues a check-in for `target`, due `delay_seconds` after `now`.
    ///
    /// A recurring check-in without `interval_seconds` repeats every
    /// `delay_seconds`.
    pub async fn schedule(
        &self,
        target: &WorkerId,
        delay_seconds: u64,
        note: &str,
        recurring: bool,
        interval_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledCheckIn> {
        if !self.supervisor.contains(target)? {
            return Err(OrchestratorError::UnknownRecipient(target.clone()));
        }
        if note.trim().is_empty() {
            return Err(OrchestratorError::ProtocolViolation(ViolationReason::EmptyBody));
        }

        let check_in = ScheduledCheckIn::new(
            target.clone(),
            now,
            delay_seconds,
            note,
            recurring,
            interval_seconds,
        );

        let mut queue = self.queue.lock().await;
        self.reload(&mut queue)?;
        queue.push(check_in.clone());
        self.save(&queue)?;

        info!(
            check_in_id = %check_in.id,
            worker_id = %target,
            fire_at = %check_in.fire_at,
            recurring,
            "check-in scheduled"
        );
        Ok(check_in)
    }

    /// Removes a pending check-in. Unknown or already fired ids are a no-op.
    ///
    /// Returns true if something was removed.
    pub async fn cancel(&self, id: &CheckInId) -> Result<bool> {
        let mut queue = self.queue.lock().await;
        self.reload(&mut queue)?;

        let before = queue.heap.len();
        queue.heap.retain(|p| &p.check_in.id != id);
        let removed = queue.heap.len() != before;

        if removed {
            self.save(&queue)?;
            info!(check_in_id = %id, "check-in cancelled");
        } else {
            debug!(check_in_id = %id, "cancel: no such check-in");
        }
        Ok(removed)
    }

    /// Pending check-ins, earliest first.
    pub async fn pending(&self) -> Result<Vec<ScheduledCheckIn>> {
        let mut queue = self.queue.lock().await;
        self.reload(&mut queue)?;
        Ok(queue.sorted())
    }

    /// Fires every check-in due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut queue = self.queue.lock().await;
        self.reload(&mut queue)?;

        let mut report = TickReport::default();
        let mut due = Vec::new();
        while queue.heap.peek().is_some_and(|p| p.check_in.is_due(now)) {
            if let Some(p) = queue.heap.pop() {
                due.push(p.check_in);
            }
        }
        if due.is_empty() {
            return Ok(report);
        }

        for check_in in due {
            let message = Message::new(
                Address::external(SCHEDULER_SENDER),
                check_in.target_worker_id.clone(),
                MessageKind::Coordination,
                check_in.note.clone(),
            );

            match self.router.send(message).await {
                Ok(receipt) => {
                    let next = check_in.next_occurrence(now);
                    let rescheduled = next.is_some();
                    if let Some(next) = next {
                        queue.push(next);
                    }
                    debug!(check_in_id = %check_in.id, rescheduled, "check-in fired");
                    self.emit(RuntimeEvent::CheckInFired {
                        check_in_id: check_in.id.clone(),
                        worker_id: check_in.target_worker_id.clone(),
                        message_id: receipt.message_id.clone(),
                    });
                    report.fired.push(FiredCheckIn {
                        check_in_id: check_in.id,
                        worker_id: check_in.target_worker_id,
                        message_id: receipt.message_id,
                        rescheduled,
                    });
                }
                Err(e @ (OrchestratorError::UnknownRecipient(_) | OrchestratorError::ProtocolViolation(_))) => {
                    warn!(check_in_id = %check_in.id, error = %e, "dropping check-in");
                    report.dropped.push(check_in.id);
                }
                Err(e) => {
                    // Keep it for the next tick.
                    warn!(check_in_id = %check_in.id, error = %e, "check-in not sent, will retry");
                    queue.push(check_in);
                }
            }
        }

        self.save(&queue)?;
        Ok(report)
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }
}
