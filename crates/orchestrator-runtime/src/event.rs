//! Runtime events.

use orchestrator_models::{CheckInId, GapId, MessageId, WorkerId, WorkerState};

/// Events broadcast by the orchestrator components.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    WorkerSpawned {
        worker_id: WorkerId,
        session: String,
        window: u32,
    },
    WorkerStateChanged {
        worker_id: WorkerId,
        from: WorkerState,
        to: WorkerState,
    },
    WorkerRestarted {
        worker_id: WorkerId,
        restart_count: u32,
    },
    WorkerTerminated {
        worker_id: WorkerId,
    },
    MessageDelivered {
        message_id: MessageId,
        worker_id: WorkerId,
    },
    /// Recorded in the conversation but not yet typed into the worker's window.
    MessageDeferred {
        message_id: MessageId,
        worker_id: WorkerId,
        reason: String,
    },
    MessageRejected {
        message_id: MessageId,
        reason: String,
    },
    GapDetected {
        gap_id: GapId,
        worker_id: WorkerId,
        duration_seconds: i64,
    },
    GapResolved {
        gap_id: GapId,
        worker_id: WorkerId,
    },
    /// Recovery gave up; a human or orchestrator should look at the worker.
    Escalated {
        gap_id: GapId,
        worker_id: WorkerId,
        reason: String,
    },
    CheckInFired {
        check_in_id: CheckInId,
        worker_id: WorkerId,
        message_id: MessageId,
    },
}

impl RuntimeEvent {
    /// Returns the worker this event concerns, if any.
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            RuntimeEvent::WorkerSpawned { worker_id, .. }
            | RuntimeEvent::WorkerStateChanged { worker_id, .. }
            | RuntimeEvent::WorkerRestarted { worker_id, .. }
            | RuntimeEvent::WorkerTerminated { worker_id }
            | RuntimeEvent::MessageDelivered { worker_id, .. }
            | RuntimeEvent::MessageDeferred { worker_id, .. }
            | RuntimeEvent::GapDetected { worker_id, .. }
            | RuntimeEvent::GapResolved { worker_id, .. }
            | RuntimeEvent::Escalated { worker_id, .. }
            | RuntimeEvent::CheckInFired { worker_id, .. } => Some(worker_id),
            RuntimeEvent::MessageRejected { .. } => None,
        }
    }

    /// Returns true for events that need human attention.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            RuntimeEvent::Escalated { .. } | RuntimeEvent::MessageRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_worker_id() {
        let worker_id = WorkerId::from("executor-1");

        let event = RuntimeEvent::WorkerTerminated {
            worker_id: worker_id.clone(),
        };
        assert_eq!(event.worker_id(), Some(&worker_id));

        let event = RuntimeEvent::GapDetected {
            gap_id: GapId::from("gap-1"),
            worker_id: worker_id.clone(),
            duration_seconds: 121,
        };
        assert_eq!(event.worker_id(), Some(&worker_id));

        let event = RuntimeEvent::MessageRejected {
            message_id: MessageId::from("msg-1"),
            reason: "empty body".into(),
        };
        assert_eq!(event.worker_id(), None);
    }

    #[test]
    fn test_event_is_alert() {
        let event = RuntimeEvent::Escalated {
            gap_id: GapId::from("gap-1"),
            worker_id: WorkerId::from("executor-1"),
            reason: "still silent after restart".into(),
        };
        assert!(event.is_alert());

        let event = RuntimeEvent::WorkerRestarted {
            worker_id: WorkerId::from("executor-1"),
            restart_count: 1,
        };
        assert!(!event.is_alert());
    }
}
