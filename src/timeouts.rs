use std::time::Duration;
use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle, time::sleep};

/// The four independent timeout clocks governing an activity attempt.
///
/// Carried as a tag on timeout events so a single transition handler can
/// dispatch on it, rather than four distinct event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutType {
    /// Attempt sat undispatched past its schedule-to-start timeout.
    ScheduleToStart,
    /// Attempt did not close within the schedule-to-close window.
    ScheduleToClose,
    /// Attempt ran past its start-to-close timeout.
    StartToClose,
    /// Worker went silent past the heartbeat timeout.
    Heartbeat,
}

impl TimeoutType {
    /// The well-known synthetic failure reason recorded for this timeout.
    pub fn failure_reason(self) -> &'static str {
        match self {
            TimeoutType::ScheduleToStart => "Timeout:SCHEDULE_TO_START",
            TimeoutType::ScheduleToClose => "Timeout:SCHEDULE_TO_CLOSE",
            TimeoutType::StartToClose => "Timeout:START_TO_CLOSE",
            TimeoutType::Heartbeat => "Timeout:HEARTBEAT",
        }
    }
}

/// A timer that fired for a specific attempt. The receiving side validates
/// the attempt against the live record, which is what makes firing idempotent
/// from the state machine's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimerFired {
    pub activity_id: String,
    pub attempt: u32,
    pub timeout_type: TimeoutType,
    /// Which arming of the heartbeat clock produced this fire. A fire queued
    /// before a heartbeat re-armed the clock carries the old generation and
    /// must lose to the committed heartbeat. Non-heartbeat clocks arm once
    /// per attempt and stay at zero.
    pub heartbeat_generation: u32,
}

/// Time-driven signals flowing into the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerMsg {
    /// One of the four timeout clocks elapsed.
    Fired(TimerFired),
    /// A retry backoff elapsed and the next attempt may be scheduled.
    RetryElapsed { activity_id: String, attempt: u32 },
}

/// Holds the (up to four) armed timers for one activity attempt. Timers for
/// phases that have not begun (start-to-close, heartbeat) are armed by
/// [TimeoutBag::mark_started]. Dropping the bag disarms everything, so any
/// transition that replaces or removes the owning record also kills its
/// timers.
pub(crate) struct TimeoutBag {
    activity_id: String,
    attempt: u32,
    tx: UnboundedSender<TimerMsg>,
    schedule_to_start: Option<JoinHandle<()>>,
    schedule_to_close: Option<JoinHandle<()>>,
    start_to_close: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    start_to_close_dur: Option<Duration>,
    heartbeat_dur: Option<Duration>,
    /// Bumped on every heartbeat re-arm so fires from a superseded deadline
    /// can be told apart from the live one.
    heartbeat_generation: u32,
}

impl TimeoutBag {
    /// Arm the scheduling-phase timers for a new attempt. Must be called as
    /// soon as the attempt enters `Scheduled`.
    pub(crate) fn new(
        activity_id: String,
        attempt: u32,
        schedule_to_start: Option<Duration>,
        schedule_to_close: Option<Duration>,
        start_to_close: Option<Duration>,
        heartbeat_timeout: Option<Duration>,
        tx: UnboundedSender<TimerMsg>,
    ) -> Self {
        let mut bag = Self {
            activity_id,
            attempt,
            tx,
            schedule_to_start: None,
            schedule_to_close: None,
            start_to_close: None,
            heartbeat: None,
            start_to_close_dur: start_to_close,
            heartbeat_dur: heartbeat_timeout,
            heartbeat_generation: 0,
        };
        bag.schedule_to_start =
            schedule_to_start.map(|d| bag.spawn_timer(d, TimeoutType::ScheduleToStart));
        bag.schedule_to_close =
            schedule_to_close.map(|d| bag.spawn_timer(d, TimeoutType::ScheduleToClose));
        bag
    }

    /// Must be called when a worker claims the attempt. Disarms
    /// schedule-to-start and arms the execution-phase timers.
    pub(crate) fn mark_started(&mut self) {
        if let Some(h) = self.schedule_to_start.take() {
            h.abort();
        }
        self.start_to_close = self
            .start_to_close_dur
            .map(|d| self.spawn_timer(d, TimeoutType::StartToClose));
        self.heartbeat = self
            .heartbeat_dur
            .map(|d| self.spawn_timer(d, TimeoutType::Heartbeat));
    }

    /// Re-arm (not disarm) the heartbeat timer under a fresh generation, so a
    /// fire from the superseded deadline that is already in flight gets
    /// rejected. No-op when heartbeating is disabled for the activity.
    pub(crate) fn record_heartbeat(&mut self) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        if self.heartbeat_dur.is_some() {
            self.heartbeat_generation += 1;
        }
        self.heartbeat = self
            .heartbeat_dur
            .map(|d| self.spawn_timer(d, TimeoutType::Heartbeat));
    }

    /// Generation of the currently armed heartbeat timer; fires carrying an
    /// older generation are stale.
    pub(crate) fn heartbeat_generation(&self) -> u32 {
        self.heartbeat_generation
    }

    fn spawn_timer(&self, duration: Duration, timeout_type: TimeoutType) -> JoinHandle<()> {
        let fired = TimerFired {
            activity_id: self.activity_id.clone(),
            attempt: self.attempt,
            timeout_type,
            heartbeat_generation: self.heartbeat_generation,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(duration).await;
            // The manager may already be gone during shutdown
            let _ = tx.send(TimerMsg::Fired(fired));
        })
    }
}

impl Drop for TimeoutBag {
    fn drop(&mut self) {
        for h in [
            self.schedule_to_start.as_ref(),
            self.schedule_to_close.as_ref(),
            self.start_to_close.as_ref(),
            self.heartbeat.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn bag_with(
        s2s: Option<u64>,
        s2c: Option<u64>,
        s2close: Option<u64>,
        hb: Option<u64>,
    ) -> (TimeoutBag, tokio::sync::mpsc::UnboundedReceiver<TimerMsg>) {
        let (tx, rx) = unbounded_channel();
        let ms = |v: Option<u64>| v.map(Duration::from_millis);
        (
            TimeoutBag::new(
                "act".to_string(),
                1,
                ms(s2s),
                ms(s2c),
                ms(s2close),
                ms(hb),
                tx,
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn schedule_to_start_fires_when_undispatched() {
        let (_bag, mut rx) = bag_with(Some(20), Some(500), None, None);
        let msg = rx.recv().await.unwrap();
        assert_matches!(
            msg,
            TimerMsg::Fired(TimerFired {
                timeout_type: TimeoutType::ScheduleToStart,
                attempt: 1,
                ..
            })
        );
    }

    #[tokio::test]
    async fn start_disarms_schedule_to_start() {
        let (mut bag, mut rx) = bag_with(Some(30), None, Some(60), None);
        bag.mark_started();
        let msg = rx.recv().await.unwrap();
        assert_matches!(
            msg,
            TimerMsg::Fired(TimerFired {
                timeout_type: TimeoutType::StartToClose,
                ..
            })
        );
    }

    #[tokio::test]
    async fn heartbeat_timer_rearms() {
        let (mut bag, mut rx) = bag_with(None, None, None, Some(60));
        bag.mark_started();
        sleep(Duration::from_millis(30)).await;
        bag.record_heartbeat();
        sleep(Duration::from_millis(30)).await;
        // Original deadline has passed but the re-arm moved it
        assert!(rx.try_recv().is_err());
        let msg = rx.recv().await.unwrap();
        assert_matches!(
            msg,
            TimerMsg::Fired(TimerFired {
                timeout_type: TimeoutType::Heartbeat,
                ..
            })
        );
    }

    #[tokio::test]
    async fn heartbeat_rearms_bump_the_generation() {
        let (mut bag, mut rx) = bag_with(None, None, None, Some(20));
        bag.mark_started();
        assert_eq!(bag.heartbeat_generation(), 0);
        bag.record_heartbeat();
        bag.record_heartbeat();
        assert_eq!(bag.heartbeat_generation(), 2);
        let msg = rx.recv().await.unwrap();
        assert_matches!(
            msg,
            TimerMsg::Fired(TimerFired {
                timeout_type: TimeoutType::Heartbeat,
                heartbeat_generation: 2,
                ..
            })
        );
    }

    #[tokio::test]
    async fn dropping_the_bag_disarms_everything() {
        let (bag, mut rx) = bag_with(Some(20), Some(20), None, None);
        drop(bag);
        sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
