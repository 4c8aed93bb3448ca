use crate::timeouts::TimeoutType;
use parking_lot::Mutex;
use std::time::SystemTime;

/// One immutable lifecycle event, emitted for exactly one committed
/// transition. Events for a given activity appear in the order the
/// transitions committed, which is the total order the consuming decision
/// logic depends on.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    /// An attempt entered `Scheduled` (the first one, or a retry re-entry).
    Scheduled {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
        activity_type: String,
    },
    /// A worker claimed the attempt.
    Started {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
        worker_identity: String,
    },
    /// Terminal: the worker reported success.
    Completed {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
        result: Vec<u8>,
    },
    /// Terminal: the worker reported a failure that was not retried.
    Failed {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
        reason: String,
        details: Option<Vec<u8>>,
        worker_identity: Option<String>,
    },
    /// Terminal: a timeout clock fired and no retry followed.
    TimedOut {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
        timeout_type: TimeoutType,
        last_heartbeat_details: Option<Vec<u8>>,
    },
    /// Cancellation was requested; advisory until the worker observes it.
    CancelRequested {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
    },
    /// Terminal: canceled before dispatch, or the worker confirmed the
    /// cancellation.
    Canceled {
        activity_id: String,
        attempt: u32,
        time: SystemTime,
        details: Option<Vec<u8>>,
    },
}

impl ActivityEvent {
    pub fn activity_id(&self) -> &str {
        match self {
            ActivityEvent::Scheduled { activity_id, .. }
            | ActivityEvent::Started { activity_id, .. }
            | ActivityEvent::Completed { activity_id, .. }
            | ActivityEvent::Failed { activity_id, .. }
            | ActivityEvent::TimedOut { activity_id, .. }
            | ActivityEvent::CancelRequested { activity_id, .. }
            | ActivityEvent::Canceled { activity_id, .. } => activity_id,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            ActivityEvent::Scheduled { attempt, .. }
            | ActivityEvent::Started { attempt, .. }
            | ActivityEvent::Completed { attempt, .. }
            | ActivityEvent::Failed { attempt, .. }
            | ActivityEvent::TimedOut { attempt, .. }
            | ActivityEvent::CancelRequested { attempt, .. }
            | ActivityEvent::Canceled { attempt, .. } => *attempt,
        }
    }
}

/// Append-only, ordered sink the external history store drains. Appends
/// happen under the same per-activity commit as the transition itself, so
/// per-activity event order equals commit order.
#[derive(Default)]
pub(crate) struct EventLog {
    inner: Mutex<Vec<ActivityEvent>>,
}

impl EventLog {
    pub(crate) fn append(&self, event: ActivityEvent) {
        debug!(event = ?event, "Emitting activity event");
        self.inner.lock().push(event);
    }

    /// Hand all accumulated events to the consumer, oldest first.
    pub(crate) fn drain(&self) -> Vec<ActivityEvent> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub(crate) fn snapshot(&self) -> Vec<ActivityEvent> {
        self.inner.lock().clone()
    }
}
