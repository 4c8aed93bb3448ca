//! Heartbeat liveness handling.
//!
//! A heartbeat proves the worker holding an attempt is still alive. Applying
//! one overwrites the recorded details and re-arms the heartbeat timeout
//! clock. The heartbeat response is also the only channel back to a running
//! worker, so it carries the current cancellation flag out to it.

use crate::activity::ActivityTaskInfo;
use std::time::SystemTime;

/// What a worker gets back for an accepted heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Cancellation has been requested; the worker may stop early and report
    /// cancellation as its outcome. Advisory, never preemptive.
    pub cancel_requested: bool,
}

/// Apply an already-validated heartbeat to the activity record. The caller
/// holds the per-activity exclusive section and has checked the task token.
pub(crate) fn apply(
    info: &mut ActivityTaskInfo,
    details: Vec<u8>,
    now: SystemTime,
) -> HeartbeatResponse {
    info.last_heartbeat_time = Some(now);
    info.last_heartbeat_details = Some(details);
    if let Some(bag) = info.timeouts.as_mut() {
        bag.record_heartbeat();
    }
    HeartbeatResponse {
        cancel_requested: info.cancel_requested,
    }
}
