//! Step protocol between a task body and its driver.
//!
//! A body is driven one step at a time. Each step receives a `ResumeInput`
//! describing why it was woken and answers with a `Step`: suspend on some
//! condition, complete with a value, or fail.
//!
//! # なぜクロージャで書けるのか
//! `StepBody` は `FnMut(ResumeInput) -> Step + Send + 'static` に対して blanket
//! 実装されています。ループ変数などの状態はクロージャに move して持たせれば
//! よく、専用の struct を書く必要はありません。
//!
//! ```ignore
//! let mut n = 0;
//! let task = Task::new(move |_input: ResumeInput| {
//!     n += 1;
//!     if n > 3 { Step::complete(n) } else { Step::sleep(Duration::from_secs(1)) }
//! });
//! ```

use std::time::Duration;

use serde_json::Value;

use super::errors::TaskError;
use super::ids::TaskHandle;

/// Why a body is being resumed.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeInput {
    /// First step of the task.
    Start,

    /// The delay requested with `WaitDescriptor::Delay` elapsed.
    TimerElapsed,

    /// The task yielded and got its turn again.
    Yielded,

    /// The awaited handle reached a terminal state.
    Resolved(Result<Value, TaskError>),
}

/// Condition under which a suspended task becomes ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDescriptor {
    /// Ready once the duration has elapsed on the scheduler's timer.
    Delay(Duration),

    /// Ready once the handle is terminal; resumed with its outcome.
    Handle(TaskHandle),

    /// Ready immediately, behind everything already queued.
    Yield,
}

/// What a body answers for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Suspend(WaitDescriptor),
    Complete(Value),
    Fail(String),
}

impl Step {
    pub fn sleep(duration: Duration) -> Self {
        Step::Suspend(WaitDescriptor::Delay(duration))
    }

    pub fn await_handle(handle: TaskHandle) -> Self {
        Step::Suspend(WaitDescriptor::Handle(handle))
    }

    pub fn yield_now() -> Self {
        Step::Suspend(WaitDescriptor::Yield)
    }

    pub fn complete(value: impl Into<Value>) -> Self {
        Step::Complete(value.into())
    }

    pub fn fail(reason: impl std::fmt::Display) -> Self {
        Step::Fail(reason.to_string())
    }
}

/// Result of driving a task by one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    Suspended(WaitDescriptor),
    Completed(Value),
    /// Step failure or observed cancellation; the task's state tells which.
    Failed(TaskError),
}

impl Resumption {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Resumption::Suspended(_))
    }
}

/// User logic of a task: an opaque callable advanced one step at a time.
pub trait StepBody: Send + 'static {
    fn step(&mut self, input: ResumeInput) -> Step;
}

impl<F> StepBody for F
where
    F: FnMut(ResumeInput) -> Step + Send + 'static,
{
    fn step(&mut self, input: ResumeInput) -> Step {
        self(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn helpers_build_expected_steps() {
        assert_eq!(
            Step::sleep(Duration::from_secs(1)),
            Step::Suspend(WaitDescriptor::Delay(Duration::from_secs(1)))
        );
        assert_eq!(Step::yield_now(), Step::Suspend(WaitDescriptor::Yield));
        assert_eq!(Step::complete(3), Step::Complete(json!(3)));
        assert_eq!(Step::fail("nope"), Step::Fail("nope".to_string()));
    }

    #[test]
    fn closures_are_step_bodies() {
        let mut calls = 0;
        let mut body = move |input: ResumeInput| {
            calls += 1;
            match input {
                ResumeInput::Start => Step::yield_now(),
                _ => Step::complete(calls),
            }
        };

        assert_eq!(body.step(ResumeInput::Start), Step::yield_now());
        assert_eq!(body.step(ResumeInput::Yielded), Step::complete(2));
    }

    #[test]
    fn only_suspension_is_non_terminal() {
        assert!(!Resumption::Suspended(WaitDescriptor::Yield).is_terminal());
        assert!(Resumption::Completed(json!(null)).is_terminal());
        assert!(Resumption::Failed(TaskError::Cancelled).is_terminal());
    }
}
