//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Suspended -> Running -> ... (one round per step)
/// - Running -> Failed (step reported an error or panicked)
/// - Pending | Suspended -> Cancelled (cancellation seen at a suspension point,
///   or scheduler shutdown)
///
/// A task enters a terminal state exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, never resumed.
    Pending,

    /// Assigned to a worker slot, executing one step.
    Running,

    /// Waiting on a timer, a handle, or a plain yield.
    Suspended,

    /// Finished with a value.
    Completed,

    /// Finished with a step failure.
    Failed,

    /// Stopped at a suspension point before finishing.
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Is the task at a suspension boundary (eligible for `resume`)?
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Suspended)
    }
}
