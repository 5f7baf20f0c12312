//! Scheduler - owns tasks and decides when each one runs.
//!
//! # 構成
//! - スケジューリングループは一つ (`run` / `run_until_idle`)。`Notify`、
//!   タイマーの期限、レーンからの報告で起きる
//! - ワーカースロットは固定数。ディスパッチされたタスクはレーン
//!   (`tokio::spawn`) に move され、1 step だけ resume されて mpsc で戻る。
//!   スロットが空くのは報告を反映した後
//! - 状態はすべて `SchedulerState` にあり、一つの mutex で守る。await を
//!   跨いでロックを持たない。通知 (`notify_one`) はロックを離してから
//!
//! # 時間
//! 遅延もタイムアウトも `Timer` port を通す。`SchedulerBuilder::timer` で
//! 差し替えた場合は `Scheduler::timeout` で同じ時計のタイムアウトを作る。
//!
//! `Scheduler` is a cheap handle (`Clone`); submit, await and shutdown can be
//! called from anywhere while the loop runs elsewhere (see `start`).

mod combinator;
mod config;
mod slot;
mod state;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub use self::config::SchedulerConfig;
use self::state::{Dispatch, LaneReport, Observation, SchedulerState};
use crate::cancel::{CancellationSource, TimeoutHandle};
use crate::domain::{SchedulerError, TaskError, TaskHandle, TaskState};
use crate::observability::{RunSummary, SchedulerCounts, TaskReport};
use crate::ports::{Clock, SystemClock, Timer, TokioTimer};
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    UntilIdle,
    UntilShutdown,
}

struct Inner {
    state: Mutex<SchedulerState>,
    notify: Notify,
    timer: Arc<dyn Timer>,
    lanes_tx: mpsc::UnboundedSender<LaneReport>,
    /// Held by the running loop; `try_lock` failing means a loop is active.
    lanes_rx: Mutex<mpsc::UnboundedReceiver<LaneReport>>,
    config: SchedulerConfig,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Builds a `Scheduler`, validating the configuration up front.
///
/// ```ignore
/// let scheduler = Scheduler::builder().pool_size(4).build()?;
/// ```
#[derive(Default)]
pub struct SchedulerBuilder {
    config: Option<SchedulerConfig>,
    pool_size: Option<usize>,
    history_limit: Option<usize>,
    timer: Option<Arc<dyn Timer>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides `config.pool_size`.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    /// Overrides `config.history_limit`.
    pub fn history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = Some(history_limit);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        let mut config = self.config.unwrap_or_default();
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(history_limit) = self.history_limit {
            config.history_limit = history_limit;
        }
        config.validate()?;

        let timer = self.timer.unwrap_or_else(|| Arc::new(TokioTimer));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (lanes_tx, lanes_rx) = mpsc::unbounded_channel();

        debug!(pool_size = config.pool_size, "scheduler built");
        Ok(Scheduler {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::new(
                    config.pool_size,
                    config.history_limit,
                    clock,
                )),
                notify: Notify::new(),
                timer,
                lanes_tx,
                lanes_rx: Mutex::new(lanes_rx),
                config,
            }),
        })
    }
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::builder().config(config).build()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.config.pool_size
    }

    /// Arm a timeout on `source` using this scheduler's `Timer`, so delays
    /// and timeouts follow the same clock.
    pub fn timeout(&self, source: &CancellationSource, duration: Duration) -> TimeoutHandle {
        source.with_timeout_on(Arc::clone(&self.inner.timer), duration)
    }

    /// Enqueue a task. Returns immediately.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle, SchedulerError> {
        let handle = self.inner.state.lock().await.submit(task)?;
        self.inner.notify.notify_one();
        Ok(handle)
    }

    /// Combine handles into one that resolves when all of them are done,
    /// or as soon as one fails.
    pub async fn when_all(&self, handles: &[TaskHandle]) -> Result<TaskHandle, SchedulerError> {
        let handle = self.inner.state.lock().await.when_all(handles)?;
        self.inner.notify.notify_one();
        Ok(handle)
    }

    /// Wait for the outcome of `handle` and take it.
    ///
    /// Needs a scheduling loop running concurrently (`start`) unless the
    /// handle has already finished. A result can be taken once; afterwards
    /// the handle is unknown.
    pub async fn await_result(&self, handle: TaskHandle) -> Result<Value, TaskError> {
        let observation = self.inner.state.lock().await.observe(handle.id());
        match observation {
            Observation::Ready(outcome) => outcome,
            // The sender only disappears with the scheduler itself.
            Observation::Waiting(rx) => rx.await.unwrap_or(Err(TaskError::SchedulerShutdown)),
            Observation::Unknown => Err(TaskError::UnknownTask(handle.id())),
        }
    }

    /// Cancel everything not yet finished and stop the loop once the
    /// in-flight steps have reported back.
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.shutdown();
        self.inner.notify.notify_one();
    }

    pub async fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        self.inner.state.lock().await.state_of(handle.id())
    }

    pub async fn report(&self, handle: TaskHandle) -> Option<TaskReport> {
        self.inner.state.lock().await.report(handle.id())
    }

    pub async fn counts(&self) -> SchedulerCounts {
        self.inner.state.lock().await.counts()
    }

    /// Failures that no one awaited. They are kept here, never rethrown.
    pub async fn unobserved_failures(&self) -> Vec<(TaskHandle, TaskError)> {
        self.inner.state.lock().await.unobserved_failures()
    }

    /// Run the scheduling loop until `shutdown` and all lanes drained.
    pub async fn run(&self) -> Result<RunSummary, SchedulerError> {
        self.drive(RunMode::UntilShutdown).await
    }

    /// Run the scheduling loop until nothing is ready, running or sleeping.
    ///
    /// Tasks suspended on a handle that never resolves stay Suspended.
    pub async fn run_until_idle(&self) -> Result<RunSummary, SchedulerError> {
        self.drive(RunMode::UntilIdle).await
    }

    /// Spawn `run` in the background.
    pub fn start(&self) -> JoinHandle<Result<RunSummary, SchedulerError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    async fn drive(&self, mode: RunMode) -> Result<RunSummary, SchedulerError> {
        let mut lanes = self
            .inner
            .lanes_rx
            .try_lock()
            .map_err(|_| SchedulerError::AlreadyRunning)?;
        debug!(?mode, pool_size = self.pool_size(), "scheduling loop started");

        let mut steps_dispatched = 0u64;
        loop {
            let (batch, next_timer) = {
                let mut state = self.inner.state.lock().await;
                state.promote_timers(self.inner.timer.now());
                let batch = state.dispatch();

                let drained = state.running() == 0;
                let done = match mode {
                    RunMode::UntilIdle => drained && (state.is_idle() || state.is_shutting_down()),
                    RunMode::UntilShutdown => drained && state.is_shutting_down(),
                };
                if done {
                    break;
                }
                (batch, state.next_timer())
            };

            steps_dispatched += batch.len() as u64;
            for dispatch in batch {
                self.spawn_lane(dispatch);
            }

            let timer = Arc::clone(&self.inner.timer);
            let wake_at = async move {
                match next_timer {
                    Some(deadline) => timer.sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(report) = lanes.recv() => {
                    let now = self.inner.timer.now();
                    let mut state = self.inner.state.lock().await;
                    state.complete_lane(report, now);
                    while let Ok(report) = lanes.try_recv() {
                        state.complete_lane(report, now);
                    }
                }
                _ = wake_at => {}
                _ = self.inner.notify.notified() => {}
            }
        }

        let counts = self.inner.state.lock().await.counts();
        debug!(steps_dispatched, ?counts, "scheduling loop stopped");
        Ok(RunSummary {
            steps_dispatched,
            counts,
        })
    }

    fn spawn_lane(&self, dispatch: Dispatch) {
        let lanes = self.inner.lanes_tx.clone();
        tokio::spawn(async move {
            let Dispatch {
                slot,
                mut task,
                input,
            } = dispatch;
            let resumption = task.resume(input);
            trace!(task = %task, slot, state = ?task.state(), "step finished");
            // Fails only when the scheduler itself is gone.
            let _ = lanes.send(LaneReport {
                slot,
                task,
                resumption,
            });
        });
    }
}
