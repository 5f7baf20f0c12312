//! Task identifiers.
//!
//! # ULID ベースの ID
//! ID には ULID (Universally Unique Lexicographically Sortable Identifier) を
//! 使います。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: timestamp が先頭にあるため、生成順にほぼ並ぶ
//! - **調整なしで生成可能**: どのスレッドからでも採番できる
//! - **128-bit**: UUID と同じサイズ
//!
//! ## TaskHandle
//! `TaskHandle` は `TaskId` の薄いラッパーで、タスクと `when_all` の両方を指せます。
//! handle を持っていてもスケジューラ内の何かを生かし続けることはありません。
//!
//! スケジューラ内部の投入順は別のシーケンス番号で管理します。同じミリ秒に
//! 作られた ID 同士の順序は保証されないためです。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a task or of a combinator handle.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId {
    ulid: Ulid,
}

impl TaskId {
    /// Mint a fresh id from the current time.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self { ulid }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.ulid)
    }
}

/// Reference to a submitted task (or to a `when_all` combinator).
///
/// Handles are plain copies of the id; holding one does not keep anything
/// alive inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(TaskId);

impl TaskHandle {
    pub fn new(id: TaskId) -> Self {
        Self(id)
    }

    pub fn id(&self) -> TaskId {
        self.0
    }
}

impl From<TaskId> for TaskHandle {
    fn from(id: TaskId) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
