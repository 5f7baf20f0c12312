//! `when_all` combinator record.
//!
//! Pure bookkeeping: the scheduler tells it when a member settles and it
//! answers with the combinator's own outcome once that is decided. It never
//! touches the members themselves, so a failure does not cancel siblings.
//!
//! # 解決ルール
//! - 最初の (キャンセル以外の) 失敗で即 Failed。以降のメンバー結果は捨てる
//! - 全メンバーが終端で、失敗なし・キャンセルあり -> Cancelled
//! - 全メンバー Completed -> メンバー順の JSON 配列で Completed
//! - 解決は一度だけ。レコード自体は全メンバーが揃うまで残る

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{TaskError, TaskId};

#[derive(Debug)]
pub(crate) struct WhenAll {
    members: Vec<TaskId>,
    results: Vec<Option<Value>>,
    settled: Vec<bool>,
    remaining: usize,
    saw_cancellation: bool,
    resolved: bool,
    created_at: DateTime<Utc>,
}

impl WhenAll {
    pub(crate) fn new(members: Vec<TaskId>, created_at: DateTime<Utc>) -> Self {
        let n = members.len();
        Self {
            members,
            results: vec![None; n],
            settled: vec![false; n],
            remaining: n,
            saw_cancellation: false,
            resolved: false,
            created_at,
        }
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Has the combinator produced its outcome?
    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Have all members settled (so the record can be dropped)?
    pub(crate) fn is_finished(&self) -> bool {
        self.remaining == 0
    }

    /// Distinct members, in first-appearance order.
    pub(crate) fn distinct_members(&self) -> Vec<TaskId> {
        let mut seen = Vec::with_capacity(self.members.len());
        for id in &self.members {
            if !seen.contains(id) {
                seen.push(*id);
            }
        }
        seen
    }

    /// Record that `member` reached a terminal state.
    ///
    /// Returns the combinator outcome the first time it is decided, `None`
    /// otherwise (still waiting, or already resolved and the result is
    /// discarded).
    pub(crate) fn member_settled(
        &mut self,
        member: TaskId,
        outcome: &Result<Value, TaskError>,
    ) -> Option<Result<Value, TaskError>> {
        for i in 0..self.members.len() {
            if self.members[i] != member || self.settled[i] {
                continue;
            }
            self.settled[i] = true;
            self.remaining -= 1;
            if let Ok(value) = outcome {
                self.results[i] = Some(value.clone());
            }
        }

        if self.resolved {
            return None;
        }

        match outcome {
            Err(e) if !e.is_cancellation() => {
                self.resolved = true;
                return Some(Err(e.clone()));
            }
            Err(_) => self.saw_cancellation = true,
            Ok(_) => {}
        }

        if self.remaining > 0 {
            return None;
        }

        self.resolved = true;
        if self.saw_cancellation {
            Some(Err(TaskError::Cancelled))
        } else {
            let values = self
                .results
                .iter_mut()
                .map(|v| v.take().unwrap_or(Value::Null))
                .collect();
            Some(Ok(Value::Array(values)))
        }
    }
}
