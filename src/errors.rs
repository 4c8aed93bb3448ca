//! Error types exposed by public APIs

/// Errors thrown by [crate::ActivityTaskManager::schedule]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The schedule request violates a constraint and no state was created.
    #[error("Invalid activity schedule: {reason}")]
    InvalidSpec {
        /// Which constraint was violated
        reason: String,
    },
    /// An activity with this id is already pending under the workflow.
    #[error("Activity with id {0} is already pending")]
    DuplicateActivityId(String),
}

/// Errors thrown by [crate::ActivityTaskManager::start]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// No dispatchable attempt exists for this id. The activity may never have
    /// been scheduled, may already be terminal, or may be waiting out a retry
    /// backoff.
    #[error("No startable activity with id {0}")]
    NotFound(String),
    /// The current attempt was already claimed by a worker.
    #[error("Activity with id {0} was already started")]
    AlreadyStarted(String),
}

/// Errors thrown by the token-bearing worker calls
/// ([crate::ActivityTaskManager::record_heartbeat],
/// [crate::ActivityTaskManager::complete], [crate::ActivityTaskManager::fail],
/// [crate::ActivityTaskManager::report_canceled])
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivityTaskError {
    /// The token does not reference a pending activity. Either the activity
    /// never existed or it already reached a terminal state.
    #[error("Task token does not reference a pending activity")]
    NotFound,
    /// The token was issued for an attempt that has since been superseded.
    /// The worker holding it should stop working on the attempt; its results
    /// can no longer be applied.
    #[error("Task token references a superseded attempt")]
    StaleToken,
}

/// Errors thrown by [crate::ActivityTaskManager::request_cancel]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    /// The activity has no active attempt (it does not exist or is already
    /// terminal), so there is nothing to cancel.
    #[error("No pending activity with id {0}")]
    NotFound(String),
}
