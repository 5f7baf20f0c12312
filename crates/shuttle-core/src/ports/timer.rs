//! Timer port - monotonic time and "wake me at" notifications.
//!
//! # 時間の扱い
//! - スケジューラの遅延 (`Step::sleep`) と `CancellationSource` のタイムアウトは
//!   どちらもこの port を通る。同じ `Timer` を渡せば同じ時計で動く
//! - `Instant + Duration` は巨大な Duration で panic するので、期限の計算は
//!   必ず `deadline_after` を使う

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Roughly 30 years; stands in for "never", like `tokio::time::sleep` does.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, saturating to a far-future instant on overflow.
pub fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// `now + delay`, or `None` if that instant cannot be represented.
pub fn checked_deadline(now: Instant, delay: Duration) -> Option<Instant> {
    now.checked_add(delay)
}

/// Timer drives delays and timeouts.
///
/// `TokioTimer` follows `tokio::time`, so a paused test runtime
/// (`start_paused = true`) gives fully deterministic virtual time.
#[async_trait]
pub trait Timer: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}
