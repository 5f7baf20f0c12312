//! shuttle-core
//!
//! Cooperative task scheduling with explicit, resumable tasks.
//!
//! # Modules
//! - **domain**: ids, task states, the step protocol, error types
//! - **ports**: `Timer` and `Clock` seams
//! - **cancel**: `CancellationSource` / `CancellationToken` / timeouts
//! - **task**: `Task`, a state machine driven one step at a time
//! - **scheduler**: bounded worker pool, scheduling loop, `when_all`
//! - **observability**: serializable reports and counters
//!
//! ```ignore
//! let scheduler = Scheduler::builder().pool_size(2).build()?;
//! let handle = scheduler.submit(Task::delayed(Duration::from_secs(1), 42)).await?;
//! let loop_ = scheduler.start();
//! assert_eq!(scheduler.await_result(handle).await?, json!(42));
//! scheduler.shutdown().await;
//! loop_.await??;
//! ```

pub mod cancel;
pub mod domain;
pub mod observability;
pub mod ports;
pub mod scheduler;
pub mod task;

pub use cancel::{CancellationSource, CancellationToken, TimeoutHandle};
pub use domain::{
    ResumeError, ResumeInput, Resumption, SchedulerError, Step, StepBody, TaskError, TaskHandle,
    TaskId, TaskState, WaitDescriptor,
};
pub use observability::{HandleKind, RunSummary, SchedulerCounts, TaskReport};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerConfig};
pub use task::Task;
