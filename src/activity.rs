use crate::{
    errors::ScheduleError, retry_logic::RetryPolicy, task_token::TaskToken, timeouts::TimeoutBag,
};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// Caller-supplied description of an activity to schedule, in wire form:
/// timeouts are whole seconds with `0` meaning disabled. Validated into a
/// [ValidActivitySchedule] before any state is created.
#[derive(Clone, Debug, Default)]
pub struct ActivitySchedule {
    /// Unique within the owning workflow execution.
    pub activity_id: String,
    /// Name of the activity implementation to invoke.
    pub activity_type: String,
    /// Opaque input handed to the worker.
    pub input: Vec<u8>,
    /// Max time an attempt may wait for a worker to claim it. 0 = disabled.
    pub schedule_to_start_seconds: i32,
    /// Max time from scheduling to close, spanning the wait and the run.
    /// 0 = disabled.
    pub schedule_to_close_seconds: i32,
    /// Max run time of a claimed attempt. 0 = disabled.
    pub start_to_close_seconds: i32,
    /// Max silence between heartbeats. 0 = heartbeating disabled.
    pub heartbeat_seconds: i32,
    /// Optional retry policy; without one, any failure is terminal.
    pub retry_policy: Option<RetryPolicy>,
}

/// An [ActivitySchedule] that passed validation, with timeouts in their
/// usable form.
#[derive(Clone, Debug)]
pub(crate) struct ValidActivitySchedule {
    pub activity_id: String,
    pub activity_type: String,
    pub input: Vec<u8>,
    pub schedule_to_start: Option<Duration>,
    pub schedule_to_close: Option<Duration>,
    pub start_to_close: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl ValidActivitySchedule {
    /// Validate a wire-form schedule. Nothing is created on failure.
    pub(crate) fn from_schedule(s: ActivitySchedule) -> Result<Self, ScheduleError> {
        let invalid = |reason: &str| ScheduleError::InvalidSpec {
            reason: reason.to_string(),
        };
        if s.activity_id.is_empty() {
            return Err(invalid("activity id must not be empty"));
        }
        if s.activity_type.is_empty() {
            return Err(invalid("activity type must not be empty"));
        }
        let secs = |v: i32, name: &str| -> Result<Option<Duration>, ScheduleError> {
            match v {
                v if v < 0 => Err(invalid(&format!("{} must not be negative", name))),
                0 => Ok(None),
                v => Ok(Some(Duration::from_secs(v as u64))),
            }
        };
        let schedule_to_start = secs(s.schedule_to_start_seconds, "schedule-to-start timeout")?;
        let schedule_to_close = secs(s.schedule_to_close_seconds, "schedule-to-close timeout")?;
        let start_to_close = secs(s.start_to_close_seconds, "start-to-close timeout")?;
        let heartbeat_timeout = secs(s.heartbeat_seconds, "heartbeat timeout")?;
        if schedule_to_close.is_none() && start_to_close.is_none() {
            return Err(invalid(
                "one of schedule-to-close or start-to-close timeout must be set",
            ));
        }
        if let Some(rp) = s.retry_policy.as_ref() {
            if rp.backoff_coefficient < 1.0 {
                return Err(invalid("retry backoff coefficient must be at least 1"));
            }
            if !rp.backoff_coefficient.is_finite() {
                return Err(invalid("retry backoff coefficient must be finite"));
            }
        }
        Ok(Self {
            activity_id: s.activity_id,
            activity_type: s.activity_type,
            input: s.input,
            schedule_to_start,
            schedule_to_close,
            start_to_close,
            heartbeat_timeout,
            retry_policy: s.retry_policy,
        })
    }
}

/// Lifecycle state of an activity. Transitions are monotonic per attempt;
/// the four right-hand states are terminal and absorbing, except that
/// `Failed`/`TimedOut` may instead loop a retried activity back to
/// `Scheduled` as a fresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivityState {
    /// Waiting to be claimed by a worker (or waiting out a retry backoff).
    Scheduled,
    /// Claimed and presumed running on a worker.
    Started,
    /// Worker reported success.
    Completed,
    /// Worker reported a failure that will not be retried.
    Failed,
    /// A timeout clock fired and no retry followed.
    TimedOut,
    /// Canceled before dispatch, or the worker confirmed cancellation.
    Canceled,
}

impl ActivityState {
    /// Terminal states are absorbing: no signal moves the activity out again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ActivityState::Scheduled | ActivityState::Started)
    }
}

/// The single mutable record for one logical activity, spanning all of its
/// retry attempts. Mutated exclusively by the lifecycle state machine under
/// the per-activity exclusive section.
pub(crate) struct ActivityTaskInfo {
    pub schedule: ValidActivitySchedule,
    /// 1-based; increases by exactly one per retry.
    pub attempt: u32,
    pub state: ActivityState,
    /// Scheduling time of the current attempt; reset per attempt.
    pub scheduled_time: SystemTime,
    /// Scheduling time of the first attempt; the anchor for the
    /// schedule-to-close cap and the expiration deadline.
    pub first_scheduled_time: SystemTime,
    /// Fixed at first scheduling; never extended by retries.
    pub expiration_deadline: Option<SystemTime>,
    pub started_time: Option<SystemTime>,
    pub last_heartbeat_time: Option<SystemTime>,
    /// Retained across retries until overwritten by a newer heartbeat.
    pub last_heartbeat_details: Option<Vec<u8>>,
    pub last_failure_reason: Option<String>,
    pub last_failure_details: Option<Vec<u8>>,
    pub last_worker_identity: Option<String>,
    pub cancel_requested: bool,
    /// Valid only for the currently active attempt while `Started`.
    pub task_token: Option<TaskToken>,
    /// Armed timers for the current attempt; absent while backing off.
    pub timeouts: Option<TimeoutBag>,
    /// Sleeping task that will re-enter `Scheduled` when the backoff elapses.
    pub backing_off_task: Option<JoinHandle<()>>,
}

impl ActivityTaskInfo {
    pub(crate) fn snapshot(&self) -> PendingActivityInfo {
        PendingActivityInfo {
            activity_id: self.schedule.activity_id.clone(),
            activity_type: self.schedule.activity_type.clone(),
            state: self.state,
            attempt: self.attempt,
            maximum_attempts: self
                .schedule
                .retry_policy
                .as_ref()
                .map_or(0, |rp| rp.maximum_attempts),
            scheduled_time: self.scheduled_time,
            expiration_time: self.expiration_deadline,
            last_started_time: self.started_time,
            last_heartbeat_time: self.last_heartbeat_time,
            heartbeat_details: self.last_heartbeat_details.clone(),
            last_failure_reason: self.last_failure_reason.clone(),
            last_failure_details: self.last_failure_details.clone(),
            last_worker_identity: self.last_worker_identity.clone(),
        }
    }
}

/// Read-only snapshot of a pending activity, as returned by
/// [crate::ActivityTaskManager::describe]. Reflects the latest committed
/// state; once the activity is no longer pending there is nothing to
/// describe and failure detail is only available through the emitted events.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingActivityInfo {
    pub activity_id: String,
    pub activity_type: String,
    pub state: ActivityState,
    pub attempt: u32,
    /// From the retry policy; 0 when unlimited or no policy.
    pub maximum_attempts: u32,
    pub scheduled_time: SystemTime,
    pub expiration_time: Option<SystemTime>,
    pub last_started_time: Option<SystemTime>,
    pub last_heartbeat_time: Option<SystemTime>,
    pub heartbeat_details: Option<Vec<u8>>,
    pub last_failure_reason: Option<String>,
    pub last_failure_details: Option<Vec<u8>>,
    pub last_worker_identity: Option<String>,
}
