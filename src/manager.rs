use crate::{
    activity::{
        ActivitySchedule, ActivityState, ActivityTaskInfo, PendingActivityInfo,
        ValidActivitySchedule,
    },
    errors::{ActivityTaskError, CancelError, ScheduleError, StartError},
    events::{ActivityEvent, EventLog},
    heartbeat::{self, HeartbeatResponse},
    retry_logic,
    task_token::TaskToken,
    timeouts::{TimeoutBag, TimeoutType, TimerFired, TimerMsg},
};
use dashmap::{mapref::entry::Entry, mapref::one::RefMut, DashMap};
use std::{sync::Arc, time::SystemTime};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::sleep,
};

/// Static configuration for an [ActivityTaskManager].
#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(setter(into))]
pub struct ManagerConfig {
    /// Workflow execution whose activities this manager tracks. Carried on
    /// every dispatched task so workers can identify their caller.
    pub workflow_id: String,
    /// Run of that workflow execution.
    #[builder(default = "uuid::Uuid::new_v4().to_string()")]
    pub run_id: String,
}

/// A dispatchable attempt handed to the external task-distribution layer.
/// Distribution matches it to a worker, which then claims it via
/// [ActivityTaskManager::start]. Transport is the distribution layer's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub workflow_id: String,
    pub run_id: String,
    pub activity_id: String,
    pub activity_type: String,
    /// 1-based attempt this dispatch is for.
    pub attempt: u32,
    pub input: Vec<u8>,
    /// Last recorded heartbeat details, so a retried attempt can resume from
    /// the progress its predecessor reported.
    pub heartbeat_details: Option<Vec<u8>>,
}

/// What a worker receives when it successfully claims an attempt. The token
/// binds every subsequent call from this worker to exactly this attempt.
#[derive(Debug, Clone)]
pub struct StartedTask {
    pub task_token: TaskToken,
    pub activity_type: String,
    pub attempt: u32,
    pub input: Vec<u8>,
    pub heartbeat_details: Option<Vec<u8>>,
}

/// Tracks every pending activity of one workflow execution from scheduling
/// to a terminal outcome: the lifecycle state machine, cancellation
/// coordination, and the sole writer of activity state.
///
/// Worker calls, timer fires, and cancellation requests arrive unordered and
/// possibly concurrently; each is serialized under the per-activity exclusive
/// section and validated against the live attempt before it may commit.
/// Whichever mutation commits first under that section wins; the loser is
/// rejected as stale.
///
/// Must be created from within a tokio runtime, which the timeout clocks and
/// retry backoffs run on.
pub struct ActivityTaskManager {
    inner: Arc<ManagerInner>,
    pending_rx: tokio::sync::Mutex<UnboundedReceiver<PendingTask>>,
    timer_pump: JoinHandle<()>,
}

struct ManagerInner {
    config: ManagerConfig,
    /// Per-activity records; the entry lock is the per-activity exclusive
    /// section.
    activities: DashMap<String, ActivityTaskInfo>,
    events: EventLog,
    timer_tx: UnboundedSender<TimerMsg>,
    pending_tx: UnboundedSender<PendingTask>,
}

impl ActivityTaskManager {
    pub fn new(config: ManagerConfig) -> Self {
        let (timer_tx, timer_rx) = unbounded_channel();
        let (pending_tx, pending_rx) = unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config,
            activities: Default::default(),
            events: Default::default(),
            timer_tx,
            pending_tx,
        });
        let pump_inner = inner.clone();
        let timer_pump = tokio::spawn(async move {
            let mut timer_rx = timer_rx;
            while let Some(msg) = timer_rx.recv().await {
                match msg {
                    TimerMsg::Fired(fired) => pump_inner.on_timeout_fired(fired),
                    TimerMsg::RetryElapsed {
                        activity_id,
                        attempt,
                    } => pump_inner.on_retry_elapsed(&activity_id, attempt),
                }
            }
        });
        Self {
            inner,
            pending_rx: tokio::sync::Mutex::new(pending_rx),
            timer_pump,
        }
    }

    /// Create the record for a new activity at attempt 1, arm its
    /// scheduling-phase timers, emit the `Scheduled` event, and queue the
    /// attempt for dispatch. Nothing is created when validation fails.
    pub fn schedule(&self, schedule: ActivitySchedule) -> Result<(), ScheduleError> {
        let valid = ValidActivitySchedule::from_schedule(schedule)?;
        let now = SystemTime::now();
        match self.inner.activities.entry(valid.activity_id.clone()) {
            Entry::Occupied(o) => Err(ScheduleError::DuplicateActivityId(o.key().clone())),
            Entry::Vacant(ve) => {
                let expiration_deadline = valid
                    .retry_policy
                    .as_ref()
                    .and_then(|rp| rp.expiration_interval)
                    .and_then(|iv| now.checked_add(iv));
                let bag = self.inner.timeout_bag(&valid, 1, now, now);
                let info = ActivityTaskInfo {
                    attempt: 1,
                    state: ActivityState::Scheduled,
                    scheduled_time: now,
                    first_scheduled_time: now,
                    expiration_deadline,
                    started_time: None,
                    last_heartbeat_time: None,
                    last_heartbeat_details: None,
                    last_failure_reason: None,
                    last_failure_details: None,
                    last_worker_identity: None,
                    cancel_requested: false,
                    task_token: None,
                    timeouts: Some(bag),
                    backing_off_task: None,
                    schedule: valid,
                };
                let info = ve.insert(info);
                self.inner.events.append(ActivityEvent::Scheduled {
                    activity_id: info.schedule.activity_id.clone(),
                    attempt: 1,
                    time: now,
                    activity_type: info.schedule.activity_type.clone(),
                });
                let _ = self.inner.pending_tx.send(self.inner.pending_task(&info));
                debug!(activity_id = %info.schedule.activity_id, "Scheduled activity");
                Ok(())
            }
        }
    }

    /// A worker's first poll claims the scheduled attempt: disarms
    /// schedule-to-start, arms start-to-close and (if configured) heartbeat,
    /// and issues the attempt's task token.
    pub fn start(
        &self,
        activity_id: &str,
        worker_identity: impl Into<String>,
    ) -> Result<StartedTask, StartError> {
        let now = SystemTime::now();
        let mut info = self
            .inner
            .activities
            .get_mut(activity_id)
            .ok_or_else(|| StartError::NotFound(activity_id.to_string()))?;
        match info.state {
            ActivityState::Started => Err(StartError::AlreadyStarted(activity_id.to_string())),
            // An attempt waiting out its backoff is not claimable
            ActivityState::Scheduled if info.backing_off_task.is_some() => {
                Err(StartError::NotFound(activity_id.to_string()))
            }
            ActivityState::Scheduled => {
                let token = TaskToken::for_attempt(activity_id, info.attempt);
                let identity = worker_identity.into();
                info.state = ActivityState::Started;
                info.started_time = Some(now);
                info.last_worker_identity = Some(identity.clone());
                info.task_token = Some(token.clone());
                if let Some(bag) = info.timeouts.as_mut() {
                    bag.mark_started();
                }
                self.inner.events.append(ActivityEvent::Started {
                    activity_id: activity_id.to_string(),
                    attempt: info.attempt,
                    time: now,
                    worker_identity: identity,
                });
                debug!(activity_id, attempt = info.attempt, "Activity started");
                Ok(StartedTask {
                    task_token: token,
                    activity_type: info.schedule.activity_type.clone(),
                    attempt: info.attempt,
                    input: info.schedule.input.clone(),
                    heartbeat_details: info.last_heartbeat_details.clone(),
                })
            }
            _ => Err(StartError::NotFound(activity_id.to_string())),
        }
    }

    /// Record a worker heartbeat for the attempt the token was issued for.
    /// Accepted heartbeats re-arm the heartbeat clock and return the current
    /// cancellation flag; stale tokens are rejected so the worker stops.
    pub fn record_heartbeat(
        &self,
        token: &TaskToken,
        details: Vec<u8>,
    ) -> Result<HeartbeatResponse, ActivityTaskError> {
        let now = SystemTime::now();
        let mut info = self.inner.checked_task(token)?;
        Ok(heartbeat::apply(&mut info, details, now))
    }

    /// Worker reported success. Always terminal; disarms every timer, emits
    /// the `Completed` event, and destroys the record.
    pub fn complete(&self, token: &TaskToken, result: Vec<u8>) -> Result<(), ActivityTaskError> {
        let now = SystemTime::now();
        let id = {
            let mut info = self.inner.checked_task(token)?;
            info.timeouts = None;
            info.task_token = None;
            info.state = ActivityState::Completed;
            self.inner.events.append(ActivityEvent::Completed {
                activity_id: info.schedule.activity_id.clone(),
                attempt: info.attempt,
                time: now,
                result,
            });
            info.schedule.activity_id.clone()
        };
        self.inner.activities.remove(&id);
        debug!(activity_id = %id, "Activity completed");
        Ok(())
    }

    /// Worker reported a failure. The retry policy evaluator decides whether
    /// a new attempt re-enters `Scheduled` after backoff (preserving
    /// heartbeat details and the expiration deadline) or the failure is
    /// terminal.
    pub fn fail(
        &self,
        token: &TaskToken,
        reason: impl Into<String>,
        details: Option<Vec<u8>>,
    ) -> Result<(), ActivityTaskError> {
        let now = SystemTime::now();
        let reason = reason.into();
        let (id, remove) = {
            let mut info = self.inner.checked_task(token)?;
            let remove =
                self.inner
                    .apply_failure(&mut info, reason, details, ActivityState::Failed, None, now);
            (info.schedule.activity_id.clone(), remove)
        };
        if remove {
            self.inner.activities.remove(&id);
        }
        Ok(())
    }

    /// Worker observed the cancellation flag and stopped early. Terminal and
    /// never retried.
    pub fn report_canceled(
        &self,
        token: &TaskToken,
        details: Option<Vec<u8>>,
    ) -> Result<(), ActivityTaskError> {
        let now = SystemTime::now();
        let id = {
            let mut info = self.inner.checked_task(token)?;
            info.timeouts = None;
            info.task_token = None;
            info.state = ActivityState::Canceled;
            self.inner.events.append(ActivityEvent::Canceled {
                activity_id: info.schedule.activity_id.clone(),
                attempt: info.attempt,
                time: now,
                details,
            });
            info.schedule.activity_id.clone()
        };
        self.inner.activities.remove(&id);
        debug!(activity_id = %id, "Activity canceled by worker");
        Ok(())
    }

    /// Request cancellation of a pending activity. A started attempt only
    /// has its flag set (visible at the next heartbeat). An undispatched one,
    /// including one waiting out a retry backoff, goes straight to terminal
    /// `Canceled` and no worker ever runs it.
    pub fn request_cancel(&self, activity_id: &str) -> Result<(), CancelError> {
        let now = SystemTime::now();
        let remove = {
            let mut info = self
                .inner
                .activities
                .get_mut(activity_id)
                .ok_or_else(|| CancelError::NotFound(activity_id.to_string()))?;
            match info.state {
                ActivityState::Started => {
                    if !info.cancel_requested {
                        info.cancel_requested = true;
                        self.inner.events.append(ActivityEvent::CancelRequested {
                            activity_id: activity_id.to_string(),
                            attempt: info.attempt,
                            time: now,
                        });
                        debug!(activity_id, "Cancellation requested for running activity");
                    }
                    false
                }
                ActivityState::Scheduled => {
                    if let Some(backoff) = info.backing_off_task.take() {
                        backoff.abort();
                    }
                    info.timeouts = None;
                    info.cancel_requested = true;
                    info.state = ActivityState::Canceled;
                    self.inner.events.append(ActivityEvent::CancelRequested {
                        activity_id: activity_id.to_string(),
                        attempt: info.attempt,
                        time: now,
                    });
                    self.inner.events.append(ActivityEvent::Canceled {
                        activity_id: activity_id.to_string(),
                        attempt: info.attempt,
                        time: now,
                        details: None,
                    });
                    debug!(activity_id, "Canceled undispatched activity");
                    true
                }
                _ => return Err(CancelError::NotFound(activity_id.to_string())),
            }
        };
        if remove {
            self.inner.activities.remove(activity_id);
        }
        Ok(())
    }

    /// Read-only snapshot of a pending activity's latest committed state, or
    /// `None` once it is no longer pending.
    pub fn describe(&self, activity_id: &str) -> Option<PendingActivityInfo> {
        self.inner
            .activities
            .get(activity_id)
            .map(|info| info.snapshot())
    }

    /// Next attempt awaiting dispatch to a worker, in scheduling order.
    /// Resolves as retries re-enter `Scheduled`.
    pub async fn next_pending_task(&self) -> Option<PendingTask> {
        self.pending_rx.lock().await.recv().await
    }

    /// Hand all emitted lifecycle events to the history consumer, oldest
    /// first.
    pub fn drain_events(&self) -> Vec<ActivityEvent> {
        self.inner.events.drain()
    }

    /// All emitted lifecycle events, without consuming them.
    pub fn events_snapshot(&self) -> Vec<ActivityEvent> {
        self.inner.events.snapshot()
    }

    /// Number of activities still pending.
    pub fn num_pending(&self) -> usize {
        self.inner.activities.len()
    }
}

impl Drop for ActivityTaskManager {
    fn drop(&mut self) {
        self.timer_pump.abort();
        // Dropping the records aborts every armed timer and backoff task
        self.inner.activities.clear();
    }
}

impl ManagerInner {
    /// Resolve a token-bearing worker call to the live record it may act on.
    /// `NotFound` when the activity does not exist any more (or never did);
    /// `StaleToken` when it exists but the token is not the active attempt's.
    fn checked_task(
        &self,
        token: &TaskToken,
    ) -> Result<RefMut<'_, String, ActivityTaskInfo>, ActivityTaskError> {
        let (id, attempt) = token.decode().ok_or(ActivityTaskError::NotFound)?;
        let id = id.to_string();
        let info = self
            .activities
            .get_mut(&id)
            .ok_or(ActivityTaskError::NotFound)?;
        if info.state != ActivityState::Started
            || info.attempt != attempt
            || info.task_token.as_ref() != Some(token)
        {
            warn!(
                activity_id = %id,
                token_attempt = attempt,
                current_attempt = info.attempt,
                "Rejecting call bearing a stale task token"
            );
            return Err(ActivityTaskError::StaleToken);
        }
        Ok(info)
    }

    /// Arm the timers for one attempt. Schedule-to-start is per attempt;
    /// schedule-to-close caps the whole attempt chain, so retries arm only
    /// its remainder.
    fn timeout_bag(
        &self,
        schedule: &ValidActivitySchedule,
        attempt: u32,
        first_scheduled: SystemTime,
        now: SystemTime,
    ) -> TimeoutBag {
        let schedule_to_close = schedule.schedule_to_close.map(|total| {
            total.saturating_sub(now.duration_since(first_scheduled).unwrap_or_default())
        });
        TimeoutBag::new(
            schedule.activity_id.clone(),
            attempt,
            schedule.schedule_to_start,
            schedule_to_close,
            schedule.start_to_close,
            schedule.heartbeat_timeout,
            self.timer_tx.clone(),
        )
    }

    fn pending_task(&self, info: &ActivityTaskInfo) -> PendingTask {
        PendingTask {
            workflow_id: self.config.workflow_id.clone(),
            run_id: self.config.run_id.clone(),
            activity_id: info.schedule.activity_id.clone(),
            activity_type: info.schedule.activity_type.clone(),
            attempt: info.attempt,
            input: info.schedule.input.clone(),
            heartbeat_details: info.last_heartbeat_details.clone(),
        }
    }

    /// Shared retry-or-terminate path for worker-reported failures and every
    /// timeout type. Returns whether the record reached a terminal state and
    /// must be destroyed by the caller (after releasing the entry lock).
    fn apply_failure(
        &self,
        info: &mut ActivityTaskInfo,
        reason: String,
        details: Option<Vec<u8>>,
        terminal_state: ActivityState,
        timeout: Option<TimeoutType>,
        now: SystemTime,
    ) -> bool {
        let verdict = retry_logic::should_retry(
            info.schedule.retry_policy.as_ref(),
            info.attempt,
            &reason,
            now,
            info.expiration_deadline,
        );
        info.last_failure_reason = Some(reason.clone());
        info.last_failure_details = details.clone();
        info.task_token = None;
        info.timeouts = None;
        match verdict {
            Ok(backoff) => {
                debug!(
                    activity_id = %info.schedule.activity_id,
                    attempt = info.attempt,
                    reason = %reason,
                    "Activity attempt failed, will retry after backing off for {:?}",
                    backoff
                );
                info.state = ActivityState::Scheduled;
                info.started_time = None;
                let activity_id = info.schedule.activity_id.clone();
                let failed_attempt = info.attempt;
                let timer_tx = self.timer_tx.clone();
                info.backing_off_task = Some(tokio::spawn(async move {
                    sleep(backoff).await;
                    let _ = timer_tx.send(TimerMsg::RetryElapsed {
                        activity_id,
                        attempt: failed_attempt,
                    });
                }));
                false
            }
            Err(no_retry) => {
                debug!(
                    activity_id = %info.schedule.activity_id,
                    attempt = info.attempt,
                    reason = %reason,
                    %no_retry,
                    "Activity attempt failed terminally"
                );
                info.state = terminal_state;
                let event = match timeout {
                    Some(timeout_type) => ActivityEvent::TimedOut {
                        activity_id: info.schedule.activity_id.clone(),
                        attempt: info.attempt,
                        time: now,
                        timeout_type,
                        last_heartbeat_details: info.last_heartbeat_details.clone(),
                    },
                    None => ActivityEvent::Failed {
                        activity_id: info.schedule.activity_id.clone(),
                        attempt: info.attempt,
                        time: now,
                        reason,
                        details,
                        worker_identity: info.last_worker_identity.clone(),
                    },
                };
                self.events.append(event);
                true
            }
        }
    }

    /// A timeout clock elapsed. Validated against the live attempt so a
    /// timer that lost the race to a worker response (or to a retry) cannot
    /// fire a second transition.
    fn on_timeout_fired(&self, fired: TimerFired) {
        let now = SystemTime::now();
        let TimerFired {
            activity_id,
            attempt,
            timeout_type,
            heartbeat_generation,
        } = fired;
        let remove = {
            let Some(mut info) = self.activities.get_mut(&activity_id) else {
                return;
            };
            // A fire queued before its bag was dropped is stale
            if info.attempt != attempt || info.timeouts.is_none() {
                debug!(activity_id, attempt, ?timeout_type, "Ignoring stale timer fire");
                return;
            }
            let phase_ok = match timeout_type {
                TimeoutType::ScheduleToStart => info.state == ActivityState::Scheduled,
                TimeoutType::ScheduleToClose => !info.state.is_terminal(),
                TimeoutType::StartToClose => info.state == ActivityState::Started,
                // An accepted heartbeat re-arms the clock under a new
                // generation; a fire queued against the old deadline lost
                // that race and must not override the heartbeat
                TimeoutType::Heartbeat => {
                    info.state == ActivityState::Started
                        && info
                            .timeouts
                            .as_ref()
                            .map_or(false, |bag| {
                                bag.heartbeat_generation() == heartbeat_generation
                            })
                }
            };
            if !phase_ok {
                debug!(activity_id, attempt, ?timeout_type, "Ignoring timer fire for wrong phase");
                return;
            }
            self.apply_failure(
                &mut info,
                timeout_type.failure_reason().to_string(),
                None,
                ActivityState::TimedOut,
                Some(timeout_type),
                now,
            )
        };
        if remove {
            self.activities.remove(&activity_id);
        }
    }

    /// A retry backoff elapsed: allocate the next attempt on the same record
    /// and queue it for dispatch. Heartbeat details, the expiration deadline,
    /// and the failure fields carry over; the attempt number increases by
    /// exactly one.
    fn on_retry_elapsed(&self, activity_id: &str, attempt: u32) {
        let now = SystemTime::now();
        let Some(mut info) = self.activities.get_mut(activity_id) else {
            return;
        };
        if info.state != ActivityState::Scheduled
            || info.attempt != attempt
            || info.backing_off_task.is_none()
        {
            debug!(activity_id, attempt, "Ignoring stale retry wakeup");
            return;
        }
        info.backing_off_task = None;
        info.attempt += 1;
        info.scheduled_time = now;
        let bag = self.timeout_bag(&info.schedule, info.attempt, info.first_scheduled_time, now);
        info.timeouts = Some(bag);
        self.events.append(ActivityEvent::Scheduled {
            activity_id: activity_id.to_string(),
            attempt: info.attempt,
            time: now,
            activity_type: info.schedule.activity_type.clone(),
        });
        let _ = self.pending_tx.send(self.pending_task(&info));
        debug!(activity_id, attempt = info.attempt, "Activity retry re-entered scheduled state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_logic::RetryPolicy;
    use std::time::Duration;

    fn manager() -> ActivityTaskManager {
        ActivityTaskManager::new(
            ManagerConfigBuilder::default()
                .workflow_id("wf")
                .build()
                .unwrap(),
        )
    }

    fn schedule(id: &str) -> ActivitySchedule {
        ActivitySchedule {
            activity_id: id.to_string(),
            activity_type: "echo".to_string(),
            input: b"in".to_vec(),
            start_to_close_seconds: 60,
            ..Default::default()
        }
    }

    fn fast_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(30),
            backoff_coefficient: 1.0,
            maximum_attempts: max_attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_emits_events_in_commit_order() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        let task = mgr.next_pending_task().await.unwrap();
        assert_eq!(task.activity_id, "a1");
        assert_eq!(task.attempt, 1);
        assert_eq!(task.workflow_id, "wf");
        let started = mgr.start("a1", "worker1").unwrap();
        assert_eq!(started.input, b"in");
        mgr.complete(&started.task_token, b"out".to_vec()).unwrap();
        assert_eq!(mgr.events_snapshot().len(), 3);
        let events = mgr.drain_events();
        assert_matches!(
            events.as_slice(),
            [
                ActivityEvent::Scheduled { attempt: 1, .. },
                ActivityEvent::Started { attempt: 1, worker_identity, .. },
                ActivityEvent::Completed { attempt: 1, result, .. },
            ] if worker_identity == "worker1" && result == b"out"
        );
        assert_eq!(mgr.num_pending(), 0);
    }

    #[tokio::test]
    async fn duplicate_activity_ids_are_rejected() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        assert_matches!(
            mgr.schedule(schedule("a1")),
            Err(ScheduleError::DuplicateActivityId(id)) if id == "a1"
        );
        // The original registration is untouched
        assert_eq!(mgr.describe("a1").unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn double_claim_is_rejected() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        mgr.start("a1", "worker1").unwrap();
        assert_matches!(
            mgr.start("a1", "worker2"),
            Err(StartError::AlreadyStarted(_))
        );
    }

    #[tokio::test]
    async fn tokens_go_stale_when_the_attempt_is_superseded() {
        let mgr = manager();
        let mut s = schedule("a1");
        s.retry_policy = Some(fast_retries(3));
        mgr.schedule(s).unwrap();
        mgr.next_pending_task().await.unwrap();
        let first = mgr.start("a1", "worker1").unwrap();
        mgr.fail(&first.task_token, "boom", None).unwrap();
        // While backing off the old token no longer refers to a live attempt
        assert_matches!(
            mgr.record_heartbeat(&first.task_token, vec![]),
            Err(ActivityTaskError::StaleToken)
        );
        assert_matches!(mgr.start("a1", "worker1"), Err(StartError::NotFound(_)));
        let task = mgr.next_pending_task().await.unwrap();
        assert_eq!(task.attempt, 2);
        let second = mgr.start("a1", "worker1").unwrap();
        assert_eq!(second.attempt, 2);
        assert_matches!(
            mgr.complete(&first.task_token, vec![]),
            Err(ActivityTaskError::StaleToken)
        );
        mgr.complete(&second.task_token, vec![]).unwrap();
    }

    #[tokio::test]
    async fn terminal_activities_are_gone() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        let started = mgr.start("a1", "worker1").unwrap();
        mgr.complete(&started.task_token, vec![]).unwrap();
        assert_matches!(
            mgr.complete(&started.task_token, vec![]),
            Err(ActivityTaskError::NotFound)
        );
        assert_matches!(
            mgr.fail(&started.task_token, "late", None),
            Err(ActivityTaskError::NotFound)
        );
        assert_matches!(mgr.request_cancel("a1"), Err(CancelError::NotFound(_)));
        assert!(mgr.describe("a1").is_none());
    }

    #[tokio::test]
    async fn cancel_before_dispatch_never_runs() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        mgr.request_cancel("a1").unwrap();
        assert_matches!(mgr.start("a1", "worker1"), Err(StartError::NotFound(_)));
        assert!(mgr.describe("a1").is_none());
        assert_matches!(
            mgr.drain_events().as_slice(),
            [
                ActivityEvent::Scheduled { .. },
                ActivityEvent::CancelRequested { .. },
                ActivityEvent::Canceled { .. },
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_of_a_running_attempt_is_cooperative() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        let started = mgr.start("a1", "worker1").unwrap();
        let resp = mgr.record_heartbeat(&started.task_token, vec![]).unwrap();
        assert!(!resp.cancel_requested);
        mgr.request_cancel("a1").unwrap();
        // Still claimable state, the worker keeps running until it notices
        assert_eq!(mgr.describe("a1").unwrap().state, ActivityState::Started);
        let resp = mgr.record_heartbeat(&started.task_token, vec![]).unwrap();
        assert!(resp.cancel_requested);
        mgr.report_canceled(&started.task_token, Some(b"cleanup done".to_vec()))
            .unwrap();
        assert!(mgr.describe("a1").is_none());
        assert_matches!(
            mgr.drain_events().last(),
            Some(ActivityEvent::Canceled { details: Some(d), .. }) if d == b"cleanup done"
        );
    }

    #[tokio::test]
    async fn repeated_cancel_requests_emit_one_event() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        mgr.start("a1", "worker1").unwrap();
        mgr.request_cancel("a1").unwrap();
        mgr.request_cancel("a1").unwrap();
        let cancel_events = mgr
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ActivityEvent::CancelRequested { .. }))
            .count();
        assert_eq!(cancel_events, 1);
    }

    #[tokio::test]
    async fn describe_tracks_the_latest_committed_state() {
        let mgr = manager();
        let mut s = schedule("a1");
        s.retry_policy = Some(fast_retries(5));
        mgr.schedule(s).unwrap();
        let info = mgr.describe("a1").unwrap();
        assert_eq!(info.state, ActivityState::Scheduled);
        assert_eq!(info.attempt, 1);
        assert_eq!(info.maximum_attempts, 5);
        let started = mgr.start("a1", "worker1").unwrap();
        mgr.record_heartbeat(&started.task_token, b"halfway".to_vec())
            .unwrap();
        let info = mgr.describe("a1").unwrap();
        assert_eq!(info.state, ActivityState::Started);
        assert_eq!(info.heartbeat_details.as_deref(), Some(&b"halfway"[..]));
        assert_eq!(info.last_worker_identity.as_deref(), Some("worker1"));
        mgr.fail(&started.task_token, "boom", Some(b"trace".to_vec()))
            .unwrap();
        // Backing off: still the failed attempt's number, start wiped
        let info = mgr.describe("a1").unwrap();
        assert_eq!(info.state, ActivityState::Scheduled);
        assert_eq!(info.attempt, 1);
        assert_eq!(info.last_started_time, None);
        assert_eq!(info.last_failure_reason.as_deref(), Some("boom"));
        assert_eq!(info.last_failure_details.as_deref(), Some(&b"trace"[..]));
        // Heartbeat details survive into the retry
        assert_eq!(info.heartbeat_details.as_deref(), Some(&b"halfway"[..]));
    }

    #[tokio::test]
    async fn queued_heartbeat_fires_lose_to_an_accepted_heartbeat() {
        let mgr = manager();
        let mut s = schedule("a1");
        s.heartbeat_seconds = 60;
        mgr.schedule(s).unwrap();
        let started = mgr.start("a1", "worker1").unwrap();
        mgr.record_heartbeat(&started.task_token, b"alive".to_vec())
            .unwrap();
        // A fire from the deadline that heartbeat superseded was already
        // queued; it must not override the committed heartbeat
        mgr.inner.on_timeout_fired(TimerFired {
            activity_id: "a1".to_string(),
            attempt: 1,
            timeout_type: TimeoutType::Heartbeat,
            heartbeat_generation: 0,
        });
        assert_eq!(mgr.describe("a1").unwrap().state, ActivityState::Started);
        assert!(!mgr
            .events_snapshot()
            .iter()
            .any(|e| matches!(e, ActivityEvent::TimedOut { .. })));
        // A fire from the live arming stays authoritative
        mgr.inner.on_timeout_fired(TimerFired {
            activity_id: "a1".to_string(),
            attempt: 1,
            timeout_type: TimeoutType::Heartbeat,
            heartbeat_generation: 1,
        });
        assert!(mgr.describe("a1").is_none());
        assert_matches!(
            mgr.drain_events().last(),
            Some(ActivityEvent::TimedOut {
                timeout_type: TimeoutType::Heartbeat,
                ..
            })
        );
    }

    #[tokio::test]
    async fn cancel_unknown_activity_errors() {
        let mgr = manager();
        assert_matches!(
            mgr.request_cancel("ghost"),
            Err(CancelError::NotFound(id)) if id == "ghost"
        );
    }

    #[tokio::test]
    async fn foreign_tokens_are_not_found() {
        let mgr = manager();
        mgr.schedule(schedule("a1")).unwrap();
        mgr.start("a1", "worker1").unwrap();
        assert_matches!(
            mgr.complete(&TaskToken(b"not ours".to_vec()), vec![]),
            Err(ActivityTaskError::NotFound)
        );
    }
}
