//! Activity task lifecycle management for a workflow orchestration engine.
//!
//! The central type is [ActivityTaskManager]: one per workflow execution, it
//! owns the state of every pending activity from [ActivityTaskManager::schedule]
//! through a terminal outcome. It enforces the lifecycle state machine, runs
//! the four timeout clocks and heartbeat liveness tracking, drives
//! retry-with-backoff, coordinates cooperative cancellation, and emits the
//! ordered [ActivityEvent] stream history consumers decide on.
//!
//! Workers interact through task tokens: each dispatched attempt gets a fresh
//! [TaskToken] at [ActivityTaskManager::start], and every subsequent call
//! bearing that token is validated against the live attempt, so responses
//! from abandoned attempts can never corrupt state.
//!
//! The manager must live on a tokio runtime; timeouts and retry backoffs are
//! spawned tasks.

#[macro_use]
extern crate tracing;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

mod activity;
mod errors;
mod events;
mod heartbeat;
mod manager;
mod retry_logic;
mod task_token;
pub mod telemetry;
mod timeouts;

pub use activity::{ActivitySchedule, ActivityState, PendingActivityInfo};
pub use errors::{ActivityTaskError, CancelError, ScheduleError, StartError};
pub use events::ActivityEvent;
pub use heartbeat::HeartbeatResponse;
pub use manager::{
    ActivityTaskManager, ManagerConfig, ManagerConfigBuilder, PendingTask, StartedTask,
};
pub use retry_logic::{NoRetry, RetryPolicy};
pub use task_token::TaskToken;
pub use timeouts::TimeoutType;
