//! Error types.
//!
//! - `TaskError`: how a task (or combinator) ended badly. Cloned to every
//!   observer of the handle.
//! - `ResumeError`: misuse of `Task::resume`.
//! - `SchedulerError`: scheduler-level failures (config, lifecycle).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskState;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    /// User logic reported an error (or panicked). Never retried.
    #[error("step failed: {0}")]
    StepFailure(String),

    /// Cancellation was requested and observed at a suspension point.
    #[error("task was cancelled")]
    Cancelled,

    /// The scheduler shut down while the task was still pending or suspended.
    #[error("scheduler shut down before the task finished")]
    SchedulerShutdown,

    /// The handle was never submitted, or its result was already taken.
    #[error("unknown task handle {0}")]
    UnknownTask(TaskId),
}

impl TaskError {
    /// Cancellation of either flavour (user request or shutdown).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled | TaskError::SchedulerShutdown)
    }

    /// Terminal state a task ends in when it stops with this error.
    pub fn terminal_state(&self) -> TaskState {
        if self.is_cancellation() {
            TaskState::Cancelled
        } else {
            TaskState::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResumeError {
    #[error("{id} is already terminal ({state:?})")]
    Terminal { id: TaskId, state: TaskState },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),

    #[error("config decode: {0}")]
    Config(#[from] serde_json::Error),

    #[error("a scheduling loop is already running")]
    AlreadyRunning,

    #[error("scheduler has been shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::step(TaskError::StepFailure("boom".into()), TaskState::Failed)]
    #[case::unknown(TaskError::UnknownTask(TaskId::generate()), TaskState::Failed)]
    #[case::cancelled(TaskError::Cancelled, TaskState::Cancelled)]
    #[case::shutdown(TaskError::SchedulerShutdown, TaskState::Cancelled)]
    fn error_maps_to_terminal_state(#[case] err: TaskError, #[case] expected: TaskState) {
        assert_eq!(err.terminal_state(), expected);
        assert_eq!(err.is_cancellation(), expected == TaskState::Cancelled);
    }

    #[test]
    fn step_failure_message_is_kept() {
        let err = TaskError::StepFailure("disk full".into());
        assert_eq!(err.to_string(), "step failed: disk full");
    }

    #[test]
    fn task_error_is_tagged_json() {
        let v = serde_json::to_value(TaskError::StepFailure("x".into())).unwrap();
        assert_eq!(v["kind"], "step_failure");
        assert_eq!(v["detail"], "x");

        let v = serde_json::to_value(TaskError::Cancelled).unwrap();
        assert_eq!(v["kind"], "cancelled");
    }
}
