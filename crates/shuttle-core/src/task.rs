//! Task: an explicit, resumable state machine.
//!
//! # 設計
//! body がユーザーのロジックを持ち、`Task` はそこに id・状態・キャンセル確認・
//! 失敗の捕捉を被せます。所有者 (通常はスケジューラのレーン) が `resume` を
//! 一回呼ぶごとに、body はちょうど 1 step 進みます。
//!
//! ## 状態遷移
//! ```text
//! Pending ──resume──> Running ──Suspend──> Suspended ──resume──> Running ...
//!                        │
//!                        ├─Complete──> Completed
//!                        ├─Fail / panic──> Failed
//!   (token requested at resume) ──> Cancelled
//! ```
//! - 終端状態への遷移は一度だけ。終端後の `resume` は `ResumeError::Terminal`
//! - panic は `catch_unwind` で `StepFailure` に変換する。リトライはしない

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::domain::{
    ResumeError, ResumeInput, Resumption, Step, StepBody, TaskError, TaskId, TaskState,
};

pub struct Task {
    id: TaskId,
    name: Option<String>,
    state: TaskState,
    body: Box<dyn StepBody>,
    cancellation: Option<CancellationToken>,
    steps_run: u32,
    error: Option<TaskError>,
}

impl Task {
    pub fn new(body: impl StepBody) -> Self {
        Self {
            id: TaskId::generate(),
            name: None,
            state: TaskState::Pending,
            body: Box::new(body),
            cancellation: None,
            steps_run: 0,
            error: None,
        }
    }

    /// Work whose result is already known: completes on its first step.
    pub fn from_value(value: impl Into<Value>) -> Self {
        let mut value = Some(value.into());
        Self::new(move |_input: ResumeInput| Step::Complete(value.take().unwrap_or(Value::Null)))
    }

    /// Sleep once, then complete with `value`.
    pub fn delayed(delay: Duration, value: impl Into<Value>) -> Self {
        let mut value = Some(value.into());
        Self::new(move |input: ResumeInput| match input {
            ResumeInput::Start => Step::sleep(delay),
            _ => Step::Complete(value.take().unwrap_or(Value::Null)),
        })
    }

    /// Wrap synchronous code as a single step.
    ///
    /// The whole closure runs inside one step, so a cancellation token can
    /// only keep it from starting.
    pub fn from_blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<Value, String> + Send + 'static,
    {
        let mut f = Some(f);
        Self::new(move |_input: ResumeInput| match f.take() {
            Some(f) => match f() {
                Ok(value) => Step::Complete(value),
                Err(reason) => Step::Fail(reason),
            },
            None => Step::fail("blocking body resumed twice"),
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Number of times the body has been stepped.
    pub fn steps_run(&self) -> u32 {
        self.steps_run
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Advance by exactly one step.
    ///
    /// Every call on a Pending or Suspended task is a suspension boundary:
    /// a requested cancellation ends the task here, before the body runs.
    pub fn resume(&mut self, input: ResumeInput) -> Result<Resumption, ResumeError> {
        if !self.state.is_resumable() {
            return Err(ResumeError::Terminal {
                id: self.id,
                state: self.state,
            });
        }

        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_requested)
        {
            debug!(task = %self, steps = self.steps_run, "cancellation observed");
            return Ok(self.finish_with(TaskError::Cancelled));
        }

        self.state = TaskState::Running;
        self.steps_run += 1;

        let step = catch_unwind(AssertUnwindSafe(|| self.body.step(input)));
        let resumption = match step {
            Ok(Step::Suspend(wait)) => {
                self.state = TaskState::Suspended;
                Resumption::Suspended(wait)
            }
            Ok(Step::Complete(value)) => {
                self.state = TaskState::Completed;
                Resumption::Completed(value)
            }
            Ok(Step::Fail(reason)) => self.finish_with(TaskError::StepFailure(reason)),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                self.finish_with(TaskError::StepFailure(format!("step panicked: {reason}")))
            }
        };
        Ok(resumption)
    }

    /// End a non-terminal task without running it again.
    ///
    /// Returns `false` if the task was already terminal.
    pub fn abort(&mut self, error: TaskError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.finish_with(error);
        true
    }

    fn finish_with(&mut self, error: TaskError) -> Resumption {
        self.state = error.terminal_state();
        self.error = Some(error.clone());
        Resumption::Failed(error)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("steps_run", &self.steps_run)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}({name})", self.id),
            None => self.id.fmt(f),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
