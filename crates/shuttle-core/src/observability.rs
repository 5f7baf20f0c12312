//! Serializable views of scheduler state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskError, TaskId, TaskState};

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Task,
    WhenAll,
}

/// Point-in-time description of one handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub kind: HandleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: TaskState,
    pub steps_run: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Task counts by state (combinators excluded). Terminal counts are
/// lifetime totals and do not shrink when old reports are evicted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerCounts {
    pub pending: usize,
    pub running: usize,
    pub suspended: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,

    /// Tasks waiting for a free slot.
    pub ready: usize,

    /// Tasks sleeping on a timer.
    pub timers: usize,

    pub pool_size: usize,

    /// Highest number of simultaneously running tasks seen.
    pub peak_running: usize,

    /// Outcomes held for `await_result` (combinators included).
    pub retained_results: usize,

    /// Reports still answerable through `report` / `state`.
    pub retained_reports: usize,
}

impl SchedulerCounts {
    pub(crate) fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Running => self.running += 1,
            TaskState::Suspended => self.suspended += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Returned by a scheduling loop when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Steps handed to worker slots during this run.
    pub steps_dispatched: u64,
    pub counts: SchedulerCounts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_each_state() {
        let mut counts = SchedulerCounts::default();
        for state in [
            TaskState::Pending,
            TaskState::Completed,
            TaskState::Completed,
            TaskState::Cancelled,
        ] {
            counts.add(state);
        }
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.failed, 0);
    }

    #[test]
    fn report_omits_empty_optionals() {
        let report = TaskReport {
            id: TaskId::generate(),
            kind: HandleKind::Task,
            name: None,
            state: TaskState::Pending,
            steps_run: 0,
            submitted_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["state"], "pending");
        assert_eq!(v["kind"], "task");
        assert!(v.get("error").is_none());
        assert!(v.get("finished_at").is_none());
    }
}
