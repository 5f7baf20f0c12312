//! Cooperative cancellation.
//!
//! # 協調的キャンセル
//! `CancellationSource` は書き込み一回きりのフラグを持ちます。タスクが見るのは
//! 読み取り専用の `CancellationToken` だけで、サスペンションポイントでフラグを
//! 確認します。
//!
//! - 実行中のコードを割り込みで止めることはない
//! - 要求は「次に resume されるとき」に処理される。先に完了すれば無視される
//! - フラグは `AtomicBool`。false -> true 以外の遷移はない
//!
//! ## タイムアウト
//! `with_timeout` / `with_timeout_on` は `Timer` 上で期限まで眠るタスクを spawn
//! し、期限が来たら `trigger` します。スケジューラと同じ `Timer` を使いたい場合は
//! `Scheduler::timeout` を使ってください。
//!
//! - 期限は一番早いものが記録される
//! - `Duration::ZERO` はその場で trigger
//! - `Instant` で表せない長さは「発火しない」扱いで、期限も記録しない

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::ports::{Timer, TokioTimer, checked_deadline};

#[derive(Debug, Default)]
struct Shared {
    /// Only transition is false -> true.
    requested: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

/// Owner side of a cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Repeated calls are no-ops.
    pub fn trigger(&self) {
        if !self.shared.requested.swap(true, Ordering::AcqRel) {
            debug!("cancellation requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }

    /// Read-only view handed to tasks.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Earliest deadline registered with `with_timeout`, if any.
    pub fn deadline(&self) -> Option<Instant> {
        *self.shared.deadline.lock()
    }

    /// Trigger automatically once `duration` has elapsed on tokio time.
    ///
    /// Must be called inside a tokio runtime. Same as `with_timeout_on` with
    /// a `TokioTimer`; use that (or `Scheduler::timeout`) when the scheduler
    /// runs on a custom `Timer`.
    pub fn with_timeout(&self, duration: Duration) -> TimeoutHandle {
        self.with_timeout_on(Arc::new(TokioTimer), duration)
    }

    /// Trigger automatically once `duration` has elapsed on `timer`.
    ///
    /// The returned handle can `dispose` the pending trigger; dropping it
    /// leaves the timer armed. With several timeouts the earliest one wins.
    /// A duration too large to represent as an instant never fires and
    /// records no deadline.
    pub fn with_timeout_on(&self, timer: Arc<dyn Timer>, duration: Duration) -> TimeoutHandle {
        if duration.is_zero() {
            self.record_deadline(timer.now());
            self.trigger();
            return TimeoutHandle {
                pending: Pending::Fired,
            };
        }

        let Some(deadline) = checked_deadline(timer.now(), duration) else {
            debug!(?duration, "timeout beyond representable time, never fires");
            return TimeoutHandle {
                pending: Pending::Never,
            };
        };
        self.record_deadline(deadline);

        let source = self.clone();
        let join = tokio::spawn(async move {
            timer.sleep_until(deadline).await;
            debug!(?duration, "cancellation timeout elapsed");
            source.trigger();
        });
        TimeoutHandle {
            pending: Pending::Armed(join),
        }
    }

    fn record_deadline(&self, deadline: Instant) {
        let mut slot = self.shared.deadline.lock();
        if slot.is_none_or(|current| deadline < current) {
            *slot = Some(deadline);
        }
    }
}

/// Read-only view of a `CancellationSource`.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    pub fn is_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.shared.deadline.lock()
    }
}

#[derive(Debug)]
enum Pending {
    /// Zero duration: triggered on creation.
    Fired,
    /// Deadline not representable: nothing was scheduled.
    Never,
    Armed(JoinHandle<()>),
}

/// Scheduling handle of a pending timeout trigger.
#[must_use = "dropping the handle keeps the timeout armed; call dispose() to cancel it"]
#[derive(Debug)]
pub struct TimeoutHandle {
    pending: Pending,
}

impl TimeoutHandle {
    /// Cancel the pending trigger. No effect if it already fired.
    pub fn dispose(self) {
        if let Pending::Armed(join) = self.pending {
            join.abort();
        }
    }

    /// Has the trigger already happened (or been aborted)?
    ///
    /// A timeout that can never fire is never finished.
    pub fn is_finished(&self) -> bool {
        match &self.pending {
            Pending::Fired => true,
            Pending::Never => false,
            Pending::Armed(join) => join.is_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_source_is_not_requested() {
        let source = CancellationSource::new();
        assert!(!source.is_requested());
        assert!(!source.token().is_requested());
        assert!(source.deadline().is_none());
    }

    #[test]
    fn triggering_twice_is_same_as_once() {
        let once = CancellationSource::new();
        once.trigger();

        let twice = CancellationSource::new();
        twice.trigger();
        twice.trigger();

        assert_eq!(once.is_requested(), twice.is_requested());
        assert_eq!(once.token().is_requested(), twice.token().is_requested());
        assert!(twice.is_requested());
    }

    #[test]
    fn tokens_observe_the_source() {
        let source = CancellationSource::new();
        let a = source.token();
        let b = a.clone();

        source.trigger();

        assert!(a.is_requested());
        assert!(b.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_triggers_after_duration() {
        let source = CancellationSource::new();
        let handle = source.with_timeout(Duration::from_secs(3));

        tokio::time::sleep(Duration::from_millis(2_999)).await;
        assert!(!source.is_requested());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(source.is_requested());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_timeout_never_triggers() {
        let source = CancellationSource::new();
        let handle = source.with_timeout(Duration::from_secs(1));
        handle.dispose();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!source.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_triggers_immediately() {
        let source = CancellationSource::new();
        let handle = source.with_timeout(Duration::ZERO);

        assert!(source.is_requested());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_deadline_is_recorded() {
        let source = CancellationSource::new();
        let start = Instant::now();

        let _late = source.with_timeout(Duration::from_secs(10));
        let _early = source.with_timeout(Duration::from_secs(2));

        assert_eq!(source.deadline(), Some(start + Duration::from_secs(2)));
        assert_eq!(source.token().deadline(), source.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_never_fires() {
        let source = CancellationSource::new();
        let handle = source.with_timeout(Duration::MAX);

        assert!(source.deadline().is_none());
        assert!(!handle.is_finished());

        tokio::time::sleep(Duration::from_secs(86_400 * 365)).await;
        assert!(!source.is_requested());

        // A later, finite timeout still works.
        let _finite = source.with_timeout(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(source.is_requested());
        handle.dispose();
    }
}
