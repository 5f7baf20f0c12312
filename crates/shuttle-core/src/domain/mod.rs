//! Domain model (ids, states, steps, errors).

pub mod errors;
pub mod ids;
pub mod state;
pub mod step;

pub use errors::{ResumeError, SchedulerError, TaskError};
pub use ids::{TaskHandle, TaskId};
pub use state::TaskState;
pub use step::{ResumeInput, Resumption, Step, StepBody, WaitDescriptor};
