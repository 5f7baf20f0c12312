//! Scheduler bookkeeping.
//!
//! Everything here is synchronous and runs under the scheduler lock; the
//! async loop in `mod.rs` only moves tasks between this state and the lanes.
//!
//! Design:
//! - `active` is the single source of truth for non-terminal tasks.
//! - `ready` and `timers` hold TaskIds only.
//! - A task sitting on a lane has `task: None` in its entry.
//! - `retired` keeps outcomes until `await_result` takes them; `history`
//!   keeps reports for finished handles.
//!
//! # 保持とエビクション
//! - `finished` は退役順のリングで、長さは `history_limit` まで
//! - リングからあふれた handle は report を捨てる。結果も、誰かが既に観測
//!   済みなら捨てる
//! - 誰も観測していない結果 (fire-and-forget の失敗など) は取られるまで残る。
//!   `unobserved_failures` から見えなくなることはない
//! - 状態ごとの件数は `totals` に累積するので、エビクションで減らない

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::combinator::WhenAll;
use super::slot::SlotPool;
use crate::domain::{
    ResumeError, ResumeInput, Resumption, SchedulerError, TaskError, TaskHandle, TaskId,
    TaskState, WaitDescriptor,
};
use crate::observability::{HandleKind, SchedulerCounts, TaskReport};
use crate::ports::{Clock, deadline_after};
use crate::task::Task;

type Outcome = Result<Value, TaskError>;

/// Timer entry for the min-heap (earliest deadline first, then submission
/// order).
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    ready_at: Instant,
    seq: u64,
    task_id: TaskId,
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Waiter {
    /// A task suspended on `WaitDescriptor::Handle`.
    Task(TaskId),
    /// A `when_all` record listening to one of its members.
    Combinator(TaskId),
    /// A caller of `await_result`.
    External(oneshot::Sender<Outcome>),
}

struct ActiveTask {
    seq: u64,
    name: Option<String>,
    state: TaskState,
    steps_run: u32,
    /// `None` while the task is on a lane.
    task: Option<Task>,
    /// Input for the next resume.
    input: Option<ResumeInput>,
    submitted_at: DateTime<Utc>,
}

struct Retired {
    outcome: Outcome,
    observed: bool,
}

/// A task taken off the ready queue and bound to a slot.
pub(crate) struct Dispatch {
    pub(crate) slot: usize,
    pub(crate) task: Task,
    pub(crate) input: ResumeInput,
}

/// What a lane sends back after one step.
pub(crate) struct LaneReport {
    pub(crate) slot: usize,
    pub(crate) task: Task,
    pub(crate) resumption: Result<Resumption, ResumeError>,
}

pub(crate) enum Observation {
    Ready(Outcome),
    Waiting(oneshot::Receiver<Outcome>),
    Unknown,
}

pub(crate) struct SchedulerState {
    pool: SlotPool,
    active: HashMap<TaskId, ActiveTask>,
    combinators: HashMap<TaskId, WhenAll>,
    retired: HashMap<TaskId, Retired>,
    history: HashMap<TaskId, TaskReport>,
    /// Retirement order, oldest first; at most `history_limit` long.
    finished: VecDeque<TaskId>,
    history_limit: usize,
    /// Terminal-state totals over the whole lifetime (tasks only).
    totals: SchedulerCounts,
    ready: VecDeque<TaskId>,
    timers: BinaryHeap<TimerEntry>,
    waiters: HashMap<TaskId, Vec<Waiter>>,
    next_seq: u64,
    shutting_down: bool,
    clock: Arc<dyn Clock>,
}

impl SchedulerState {
    pub(crate) fn new(pool_size: usize, history_limit: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: SlotPool::new(pool_size),
            active: HashMap::new(),
            combinators: HashMap::new(),
            retired: HashMap::new(),
            history: HashMap::new(),
            finished: VecDeque::new(),
            history_limit,
            totals: SchedulerCounts::default(),
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            waiters: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
            clock,
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(crate) fn running(&self) -> usize {
        self.pool.occupied()
    }

    /// Nothing ready, nothing running, nothing waiting on a timer.
    pub(crate) fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.pool.occupied() == 0 && self.timers.is_empty()
    }

    /// Is `id` a known handle that has not produced its outcome yet?
    fn is_pending(&self, id: TaskId) -> bool {
        self.active.contains_key(&id)
            || self
                .combinators
                .get(&id)
                .is_some_and(|c| !c.is_resolved())
    }

    /// Queue a task. A task that is already terminal is recorded as-is; its
    /// value was handed to whoever drove it, so it retires with `null`.
    pub(crate) fn submit(&mut self, task: Task) -> Result<TaskHandle, SchedulerError> {
        if self.shutting_down {
            return Err(SchedulerError::ShutDown);
        }

        let id = task.id();
        let seq = self.allocate_seq();
        let submitted_at = self.clock.now();

        if task.state().is_terminal() {
            // Already driven to the end by its owner; just record it.
            let error = task.error().cloned();
            let outcome = error.clone().map_or(Ok(Value::Null), Err);
            let report = TaskReport {
                id,
                kind: HandleKind::Task,
                name: task.name().map(str::to_owned),
                state: task.state(),
                steps_run: task.steps_run(),
                submitted_at,
                finished_at: Some(submitted_at),
                error,
            };
            self.retire(id, outcome, report);
            return Ok(TaskHandle::new(id));
        }

        let input = if task.steps_run() == 0 {
            ResumeInput::Start
        } else {
            ResumeInput::Yielded
        };
        debug!(task = %task, seq, "submitted");
        let entry = ActiveTask {
            seq,
            name: task.name().map(str::to_owned),
            state: task.state(),
            steps_run: task.steps_run(),
            task: Some(task),
            input: Some(input),
            submitted_at,
        };
        self.active.insert(id, entry);
        self.ready.push_back(id);
        Ok(TaskHandle::new(id))
    }

    /// Move tasks whose timer has expired to the ready queue.
    pub(crate) fn promote_timers(&mut self, now: Instant) {
        while let Some(entry) = self.timers.peek() {
            if entry.ready_at > now {
                break;
            }
            if let Some(entry) = self.timers.pop()
                && self.active.contains_key(&entry.task_id)
            {
                self.ready.push_back(entry.task_id);
            }
        }
    }

    pub(crate) fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|entry| entry.ready_at)
    }

    /// Fill free slots from the ready queue (FIFO).
    pub(crate) fn dispatch(&mut self) -> Vec<Dispatch> {
        let mut batch = Vec::new();
        while self.pool.has_free()
            && let Some(id) = self.ready.pop_front()
        {
            let Some(entry) = self.active.get_mut(&id) else {
                continue;
            };
            let Some(task) = entry.task.take() else {
                continue;
            };
            let Some(slot) = self.pool.acquire(id) else {
                entry.task = Some(task);
                self.ready.push_front(id);
                break;
            };
            entry.state = TaskState::Running;
            let input = entry.input.take().unwrap_or(ResumeInput::Yielded);
            trace!(task = %task, slot, "dispatch");
            batch.push(Dispatch { slot, task, input });
        }
        batch
    }

    /// Take back a task from its lane and act on what the step produced.
    pub(crate) fn complete_lane(&mut self, report: LaneReport, now: Instant) {
        let LaneReport {
            slot,
            mut task,
            resumption,
        } = report;
        self.pool.release(slot);

        let id = task.id();
        let Some(entry) = self.active.get_mut(&id) else {
            warn!(task = %task, "lane reported a task the scheduler does not track");
            return;
        };
        entry.steps_run = task.steps_run();
        entry.state = task.state();

        let wait = match resumption {
            Ok(Resumption::Suspended(wait)) => wait,
            Ok(Resumption::Completed(value)) => {
                self.finish(task, Ok(value));
                return;
            }
            Ok(Resumption::Failed(error)) => {
                self.finish(task, Err(error));
                return;
            }
            Err(error) => {
                warn!(%error, "lane resumed a terminal task");
                let outcome = Err(task
                    .error()
                    .cloned()
                    .unwrap_or_else(|| TaskError::StepFailure(error.to_string())));
                self.finish(task, outcome);
                return;
            }
        };

        if self.shutting_down {
            task.abort(TaskError::SchedulerShutdown);
            self.finish(task, Err(TaskError::SchedulerShutdown));
            return;
        }

        let seq = entry.seq;
        match wait {
            WaitDescriptor::Delay(delay) => {
                entry.input = Some(ResumeInput::TimerElapsed);
                entry.task = Some(task);
                self.timers.push(TimerEntry {
                    ready_at: deadline_after(now, delay),
                    seq,
                    task_id: id,
                });
            }
            WaitDescriptor::Yield => {
                entry.input = Some(ResumeInput::Yielded);
                entry.task = Some(task);
                self.ready.push_back(id);
            }
            WaitDescriptor::Handle(handle) => {
                entry.task = Some(task);
                self.wait_on(id, handle.id());
            }
        }
    }

    /// Outcome of a retired handle, for an internal observer (a task or a
    /// `when_all`). The result stays retained for `await_result`.
    fn observe_retired(&mut self, id: TaskId) -> Option<Outcome> {
        let retired = self.retired.get_mut(&id)?;
        retired.observed = true;
        let outcome = retired.outcome.clone();
        if !self.history.contains_key(&id) {
            // Already aged out of the ring, so eviction will not see it again.
            self.retired.remove(&id);
        }
        Some(outcome)
    }

    /// Suspend task `id` until `target` is terminal.
    fn wait_on(&mut self, id: TaskId, target: TaskId) {
        let resolved = if let Some(outcome) = self.observe_retired(target) {
            Some(outcome)
        } else if self.is_pending(target) {
            self.waiters
                .entry(target)
                .or_default()
                .push(Waiter::Task(id));
            None
        } else {
            Some(Err(TaskError::UnknownTask(target)))
        };

        if let Some(outcome) = resolved
            && let Some(entry) = self.active.get_mut(&id)
        {
            entry.input = Some(ResumeInput::Resolved(outcome));
            self.ready.push_back(id);
        }
    }

    fn finish(&mut self, task: Task, outcome: Outcome) {
        let id = task.id();
        let Some(entry) = self.active.remove(&id) else {
            return;
        };
        let report = TaskReport {
            id,
            kind: HandleKind::Task,
            name: entry.name,
            state: task.state(),
            steps_run: task.steps_run(),
            submitted_at: entry.submitted_at,
            finished_at: Some(self.clock.now()),
            error: outcome.as_ref().err().cloned(),
        };
        self.retire(id, outcome, report);
    }

    fn combinator_report(&self, id: TaskId, outcome: &Outcome) -> TaskReport {
        let submitted_at = self
            .combinators
            .get(&id)
            .map(WhenAll::created_at)
            .unwrap_or_else(|| self.clock.now());
        let error = outcome.as_ref().err().cloned();
        TaskReport {
            id,
            kind: HandleKind::WhenAll,
            name: Some("when_all".to_string()),
            state: error
                .as_ref()
                .map_or(TaskState::Completed, TaskError::terminal_state),
            steps_run: 0,
            submitted_at,
            finished_at: Some(self.clock.now()),
            error,
        }
    }

    /// Record a terminal outcome and wake everything waiting on it.
    ///
    /// Combinators resolved along the way are retired in the same pass.
    fn retire(&mut self, id: TaskId, outcome: Outcome, report: TaskReport) {
        let mut pending = VecDeque::from([(id, outcome, report)]);

        while let Some((id, outcome, report)) = pending.pop_front() {
            let waiters = self.waiters.remove(&id).unwrap_or_default();
            let mut observed = false;
            let mut taken = false;
            let mut woken = Vec::new();

            for waiter in waiters {
                match waiter {
                    Waiter::Task(task_id) => {
                        observed = true;
                        if let Some(entry) = self.active.get_mut(&task_id) {
                            entry.input = Some(ResumeInput::Resolved(outcome.clone()));
                            woken.push((entry.seq, task_id));
                        }
                    }
                    Waiter::Combinator(combinator_id) => {
                        observed = true;
                        let Some(combinator) = self.combinators.get_mut(&combinator_id) else {
                            continue;
                        };
                        let resolution = combinator.member_settled(id, &outcome);
                        let finished = combinator.is_finished();
                        if let Some(resolution) = resolution {
                            let report = self.combinator_report(combinator_id, &resolution);
                            pending.push_back((combinator_id, resolution, report));
                        }
                        if finished {
                            self.combinators.remove(&combinator_id);
                        }
                    }
                    Waiter::External(tx) => {
                        // A dropped receiver means that caller stopped waiting.
                        taken |= tx.send(outcome.clone()).is_ok();
                    }
                }
            }

            // Tasks released by the same handle resume in submission order.
            woken.sort_unstable();
            self.ready.extend(woken.into_iter().map(|(_, task_id)| task_id));

            match &outcome {
                Ok(_) => debug!(%id, state = ?report.state, "retired"),
                Err(error) if taken || observed => {
                    debug!(%id, state = ?report.state, %error, "retired")
                }
                Err(error) => {
                    debug!(%id, state = ?report.state, %error, "retired without observers")
                }
            }

            if report.kind == HandleKind::Task {
                self.totals.add(report.state);
            }
            self.history.insert(id, report);
            self.finished.push_back(id);
            if !taken {
                self.retired.insert(id, Retired { outcome, observed });
            }
        }
        self.evict();
    }

    /// Forget the oldest handles beyond `history_limit`.
    ///
    /// Reports go, and so do results someone has already looked at.
    /// Results nobody observed yet stay until they are taken.
    fn evict(&mut self) {
        while self.finished.len() > self.history_limit {
            let Some(id) = self.finished.pop_front() else {
                break;
            };
            self.history.remove(&id);
            if self.retired.get(&id).is_some_and(|r| r.observed) {
                self.retired.remove(&id);
            }
            trace!(%id, "evicted from history");
        }
    }

    pub(crate) fn when_all(&mut self, members: &[TaskHandle]) -> Result<TaskHandle, SchedulerError> {
        if self.shutting_down {
            return Err(SchedulerError::ShutDown);
        }

        let id = TaskId::generate();
        let combinator = WhenAll::new(
            members.iter().map(TaskHandle::id).collect(),
            self.clock.now(),
        );
        let distinct = combinator.distinct_members();
        self.combinators.insert(id, combinator);

        if distinct.is_empty() {
            let outcome = Ok(Value::Array(Vec::new()));
            let report = self.combinator_report(id, &outcome);
            self.combinators.remove(&id);
            self.retire(id, outcome, report);
            return Ok(TaskHandle::new(id));
        }

        for member in distinct {
            let settled = if let Some(outcome) = self.observe_retired(member) {
                Some(outcome)
            } else if self.is_pending(member) {
                self.waiters
                    .entry(member)
                    .or_default()
                    .push(Waiter::Combinator(id));
                None
            } else {
                Some(Err(TaskError::UnknownTask(member)))
            };

            let Some(outcome) = settled else {
                continue;
            };
            let Some(combinator) = self.combinators.get_mut(&id) else {
                break;
            };
            let resolution = combinator.member_settled(member, &outcome);
            let finished = combinator.is_finished();
            if let Some(resolution) = resolution {
                let report = self.combinator_report(id, &resolution);
                self.retire(id, resolution, report);
            }
            if finished {
                self.combinators.remove(&id);
            }
        }

        debug!(%id, members = members.len(), "when_all registered");
        Ok(TaskHandle::new(id))
    }

    /// Take a retained result, or register an external waiter.
    pub(crate) fn observe(&mut self, id: TaskId) -> Observation {
        if let Some(retired) = self.retired.remove(&id) {
            return Observation::Ready(retired.outcome);
        }
        if self.is_pending(id) {
            let (tx, rx) = oneshot::channel();
            self.waiters
                .entry(id)
                .or_default()
                .push(Waiter::External(tx));
            return Observation::Waiting(rx);
        }
        Observation::Unknown
    }

    /// Cancel everything that is not on a lane. Lanes are handled as they
    /// report back.
    pub(crate) fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.ready.clear();
        self.timers.clear();

        let mut parked: Vec<(u64, TaskId)> = self
            .active
            .iter()
            .filter(|(_, entry)| entry.task.is_some())
            .map(|(id, entry)| (entry.seq, *id))
            .collect();
        parked.sort_unstable();

        debug!(
            parked = parked.len(),
            running = self.pool.occupied(),
            "shutting down"
        );
        for (_, id) in parked {
            let Some(mut task) = self.active.get_mut(&id).and_then(|e| e.task.take()) else {
                continue;
            };
            task.abort(TaskError::SchedulerShutdown);
            self.finish(task, Err(TaskError::SchedulerShutdown));
        }
        // Waiters woken by the loop above were cancelled too.
        self.ready.clear();
    }

    pub(crate) fn state_of(&self, id: TaskId) -> Option<TaskState> {
        if let Some(entry) = self.active.get(&id) {
            return Some(entry.state);
        }
        if self.combinators.get(&id).is_some_and(|c| !c.is_resolved()) {
            return Some(TaskState::Suspended);
        }
        self.history.get(&id).map(|report| report.state)
    }

    pub(crate) fn report(&self, id: TaskId) -> Option<TaskReport> {
        if let Some(entry) = self.active.get(&id) {
            return Some(TaskReport {
                id,
                kind: HandleKind::Task,
                name: entry.name.clone(),
                state: entry.state,
                steps_run: entry.steps_run,
                submitted_at: entry.submitted_at,
                finished_at: None,
                error: None,
            });
        }
        if let Some(combinator) = self.combinators.get(&id)
            && !combinator.is_resolved()
        {
            return Some(TaskReport {
                id,
                kind: HandleKind::WhenAll,
                name: Some("when_all".to_string()),
                state: TaskState::Suspended,
                steps_run: 0,
                submitted_at: combinator.created_at(),
                finished_at: None,
                error: None,
            });
        }
        self.history.get(&id).cloned()
    }

    pub(crate) fn counts(&self) -> SchedulerCounts {
        let mut counts = SchedulerCounts {
            ready: self.ready.len(),
            timers: self.timers.len(),
            pool_size: self.pool.size(),
            peak_running: self.pool.peak(),
            retained_results: self.retired.len(),
            retained_reports: self.history.len(),
            ..self.totals.clone()
        };
        for entry in self.active.values() {
            counts.add(entry.state);
        }
        counts
    }

    /// Failed tasks nobody has looked at. Cancellations are not listed.
    pub(crate) fn unobserved_failures(&self) -> Vec<(TaskHandle, TaskError)> {
        let mut failures: Vec<(TaskHandle, TaskError)> = self
            .retired
            .iter()
            .filter(|(_, retired)| !retired.observed)
            .filter_map(|(id, retired)| match &retired.outcome {
                Err(error) if !error.is_cancellation() => {
                    Some((TaskHandle::new(*id), error.clone()))
                }
                _ => None,
            })
            .collect();
        failures.sort_by_key(|(handle, _)| handle.id());
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Step;
    use crate::ports::SystemClock;
    use serde_json::json;
    use std::time::Duration;

    fn state(pool_size: usize) -> SchedulerState {
        SchedulerState::new(pool_size, 1024, Arc::new(SystemClock))
    }

    /// Drive every dispatched task by one step, synchronously.
    fn step_all(state: &mut SchedulerState, now: Instant) -> usize {
        let batch = state.dispatch();
        let n = batch.len();
        for Dispatch {
            slot,
            mut task,
            input,
        } in batch
        {
            let resumption = task.resume(input);
            state.complete_lane(
                LaneReport {
                    slot,
                    task,
                    resumption,
                },
                now,
            );
        }
        n
    }

    #[test]
    fn timer_heap_orders_by_deadline_then_seq() {
        let now = Instant::now();
        let (a, b, c) = (TaskId::generate(), TaskId::generate(), TaskId::generate());
        let mut heap = BinaryHeap::new();
        heap.push(TimerEntry { ready_at: now + Duration::from_secs(2), seq: 0, task_id: a });
        heap.push(TimerEntry { ready_at: now + Duration::from_secs(1), seq: 2, task_id: b });
        heap.push(TimerEntry { ready_at: now + Duration::from_secs(1), seq: 1, task_id: c });

        let order: Vec<TaskId> = std::iter::from_fn(|| heap.pop().map(|e| e.task_id)).collect();
        assert_eq!(order, vec![c, b, a]);
    }

    #[test]
    fn dispatch_never_exceeds_pool() {
        let mut s = state(2);
        for i in 0..5 {
            s.submit(Task::from_value(i)).unwrap();
        }

        let batch = s.dispatch();
        assert_eq!(batch.len(), 2);
        assert_eq!(s.running(), 2);
        assert!(s.dispatch().is_empty());
        assert_eq!(s.counts().ready, 3);
    }

    #[test]
    fn ready_queue_is_fifo() {
        let mut s = state(1);
        let a = s.submit(Task::from_value("a")).unwrap();
        let b = s.submit(Task::from_value("b")).unwrap();

        let first = s.dispatch();
        assert_eq!(first[0].task.id(), a.id());
        let now = Instant::now();
        for Dispatch { slot, mut task, input } in first {
            let resumption = task.resume(input);
            s.complete_lane(LaneReport { slot, task, resumption }, now);
        }
        let second = s.dispatch();
        assert_eq!(second[0].task.id(), b.id());
    }

    #[test]
    fn timers_release_in_deadline_order() {
        let mut s = state(4);
        let slow = s.submit(Task::delayed(Duration::from_secs(2), "slow")).unwrap();
        let fast = s.submit(Task::delayed(Duration::from_secs(1), "fast")).unwrap();
        let start = Instant::now();

        step_all(&mut s, start);
        assert_eq!(s.next_timer(), Some(start + Duration::from_secs(1)));

        s.promote_timers(start + Duration::from_secs(1));
        step_all(&mut s, start + Duration::from_secs(1));
        assert_eq!(s.state_of(fast.id()), Some(TaskState::Completed));
        assert_eq!(s.state_of(slow.id()), Some(TaskState::Suspended));

        s.promote_timers(start + Duration::from_secs(2));
        step_all(&mut s, start + Duration::from_secs(2));
        assert_eq!(s.state_of(slow.id()), Some(TaskState::Completed));
        assert!(s.is_idle());
    }

    #[test]
    fn task_waiting_on_handle_is_resumed_with_its_outcome() {
        let mut s = state(1);
        let producer = Task::from_value(41);
        let producer_id = TaskHandle::new(producer.id());

        let consumer = s
            .submit(Task::new(move |input: ResumeInput| match input {
                ResumeInput::Start => Step::await_handle(producer_id),
                ResumeInput::Resolved(Ok(v)) => Step::complete(v.as_i64().unwrap_or(0) + 1),
                other => Step::fail(format!("unexpected {other:?}")),
            }))
            .unwrap();
        s.submit(producer).unwrap();

        let now = Instant::now();
        // consumer suspends on the handle and gives up the only slot
        step_all(&mut s, now);
        assert_eq!(s.state_of(consumer.id()), Some(TaskState::Suspended));
        // producer completes, consumer becomes ready
        step_all(&mut s, now);
        step_all(&mut s, now);

        match s.observe(consumer.id()) {
            Observation::Ready(outcome) => assert_eq!(outcome, Ok(json!(42))),
            _ => panic!("consumer should be retired"),
        }
    }

    #[test]
    fn waiting_on_unknown_handle_resolves_with_error() {
        let mut s = state(1);
        let ghost = TaskHandle::new(TaskId::generate());
        let t = s
            .submit(Task::new(move |input: ResumeInput| match input {
                ResumeInput::Start => Step::await_handle(ghost),
                ResumeInput::Resolved(Err(e)) => Step::complete(e.to_string()),
                _ => Step::fail("unexpected"),
            }))
            .unwrap();

        let now = Instant::now();
        step_all(&mut s, now);
        step_all(&mut s, now);

        match s.observe(t.id()) {
            Observation::Ready(Ok(v)) => {
                assert_eq!(v, json!(TaskError::UnknownTask(ghost.id()).to_string()))
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn observe_takes_the_result_once() {
        let mut s = state(1);
        let h = s.submit(Task::from_value(1)).unwrap();
        step_all(&mut s, Instant::now());

        assert!(matches!(s.observe(h.id()), Observation::Ready(Ok(_))));
        assert!(matches!(s.observe(h.id()), Observation::Unknown));
        // The report survives.
        assert_eq!(s.state_of(h.id()), Some(TaskState::Completed));
    }

    #[test]
    fn unobserved_failure_is_retained_not_raised() {
        let mut s = state(1);
        let h = s
            .submit(Task::new(|_input: ResumeInput| Step::fail("nobody listens")))
            .unwrap();
        step_all(&mut s, Instant::now());

        assert_eq!(
            s.unobserved_failures(),
            vec![(h, TaskError::StepFailure("nobody listens".into()))]
        );
        assert_eq!(s.counts().failed, 1);
    }

    #[test]
    fn shutdown_cancels_parked_tasks() {
        let mut s = state(1);
        let sleeping = s.submit(Task::delayed(Duration::from_secs(10), 1)).unwrap();
        let queued = s.submit(Task::from_value(2)).unwrap();
        step_all(&mut s, Instant::now());

        s.shutdown();

        assert_eq!(s.state_of(sleeping.id()), Some(TaskState::Cancelled));
        assert!(matches!(
            s.observe(sleeping.id()),
            Observation::Ready(Err(TaskError::SchedulerShutdown))
        ));
        // Never dispatched: the only slot was busy during the single step.
        assert_eq!(s.state_of(queued.id()), Some(TaskState::Cancelled));
        assert_eq!(s.counts().cancelled, 2);
        assert!(s.is_idle());
        assert!(matches!(
            s.submit(Task::from_value(3)),
            Err(SchedulerError::ShutDown)
        ));
    }

    #[test]
    fn lane_returning_after_shutdown_is_cancelled() {
        let mut s = state(1);
        let h = s.submit(Task::delayed(Duration::from_secs(1), 1)).unwrap();
        let mut batch = s.dispatch();
        let Dispatch { slot, mut task, input } = batch.remove(0);

        s.shutdown();
        let resumption = task.resume(input);
        s.complete_lane(LaneReport { slot, task, resumption }, Instant::now());

        assert_eq!(s.state_of(h.id()), Some(TaskState::Cancelled));
        assert_eq!(s.running(), 0);
    }

    #[test]
    fn empty_when_all_completes_immediately() {
        let mut s = state(1);
        let h = s.when_all(&[]).unwrap();

        assert_eq!(s.state_of(h.id()), Some(TaskState::Completed));
        assert!(matches!(
            s.observe(h.id()),
            Observation::Ready(Ok(v)) if v == json!([])
        ));
    }

    #[test]
    fn when_all_over_finished_members() {
        let mut s = state(2);
        let a = s.submit(Task::from_value("a")).unwrap();
        let b = s.submit(Task::from_value("b")).unwrap();
        step_all(&mut s, Instant::now());

        let all = s.when_all(&[a, b]).unwrap();
        assert!(matches!(
            s.observe(all.id()),
            Observation::Ready(Ok(v)) if v == json!(["a", "b"])
        ));
        // Members stay retained for their own observers.
        assert!(matches!(s.observe(a.id()), Observation::Ready(Ok(_))));
    }

    #[test]
    fn when_all_with_unknown_member_fails() {
        let mut s = state(1);
        let ghost = TaskHandle::new(TaskId::generate());
        let all = s.when_all(&[ghost]).unwrap();

        assert_eq!(s.state_of(all.id()), Some(TaskState::Failed));
    }

    #[test]
    fn huge_delay_does_not_disturb_other_timers() {
        let mut s = state(2);
        let forever = s.submit(Task::delayed(Duration::MAX, 0)).unwrap();
        let soon = s.submit(Task::delayed(Duration::from_secs(1), 5)).unwrap();
        let start = Instant::now();

        step_all(&mut s, start);
        assert_eq!(s.next_timer(), Some(start + Duration::from_secs(1)));

        s.promote_timers(start + Duration::from_secs(1));
        step_all(&mut s, start + Duration::from_secs(1));

        assert_eq!(s.state_of(soon.id()), Some(TaskState::Completed));
        assert_eq!(s.state_of(forever.id()), Some(TaskState::Suspended));
        assert!(s.next_timer() > Some(start + Duration::from_secs(86_400 * 365)));
    }

    #[test]
    fn history_is_bounded_and_totals_survive_eviction() {
        let mut s = SchedulerState::new(4, 8, Arc::new(SystemClock));
        let now = Instant::now();

        let mut handles = Vec::new();
        for i in 0..100 {
            handles.push(s.submit(Task::from_value(i)).unwrap());
            step_all(&mut s, now);
        }
        for h in &handles {
            assert!(matches!(s.observe(h.id()), Observation::Ready(Ok(_))));
        }

        let counts = s.counts();
        assert_eq!(counts.completed, 100);
        assert_eq!(counts.retained_results, 0);
        assert_eq!(counts.retained_reports, 8);
        assert_eq!(s.state_of(handles[0].id()), None);
        assert_eq!(s.state_of(handles[99].id()), Some(TaskState::Completed));
    }

    #[test]
    fn observed_results_age_out_but_unobserved_failures_stay() {
        let mut s = SchedulerState::new(1, 2, Arc::new(SystemClock));
        let now = Instant::now();
        let failed = s
            .submit(Task::new(|_input: ResumeInput| Step::fail("lost")))
            .unwrap();
        let watched = s.submit(Task::from_value(1)).unwrap();
        step_all(&mut s, now);
        step_all(&mut s, now);

        let all = s.when_all(&[watched]).unwrap();
        for i in 0..4 {
            s.submit(Task::from_value(i)).unwrap();
            step_all(&mut s, now);
        }

        // Seen by the combinator and pushed out of the ring.
        assert!(matches!(s.observe(watched.id()), Observation::Unknown));
        assert_eq!(
            s.unobserved_failures(),
            vec![(failed, TaskError::StepFailure("lost".into()))]
        );
        assert!(matches!(
            s.observe(all.id()),
            Observation::Ready(Ok(v)) if v == json!([1])
        ));
        assert_eq!(s.counts().failed, 1);
    }
}
