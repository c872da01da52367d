//! K-way merge over per-server runs.
//!
//! Each run is already ordered by its backend. The merger only decides the
//! next step; the engine owns the runs and performs fetches, so a run that
//! drains while its server has more pages is refilled before any head is
//! chosen.
//!
//! Ordering: sort key tuple per direction, then run index (rank), then
//! entity identity.

use std::cmp::Ordering;
use std::collections::VecDeque;

use serde_json::Value;

use crate::backend::SearchEntry;
use crate::query::{SortDirection, SortKey};

/// A run the merger can inspect.
pub trait MergeSource {
    fn head(&self) -> Option<&SearchEntry>;
    /// The buffered page is drained but the server has further pages.
    fn needs_refill(&self) -> bool;
}

impl MergeSource for VecDeque<SearchEntry> {
    fn head(&self) -> Option<&SearchEntry> {
        self.front()
    }

    fn needs_refill(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    /// Emit the head of this run.
    Emit(usize),
    /// Fetch this run's next page before continuing.
    Refill(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct KWayMerger {
    sort: Vec<SortKey>,
}

impl KWayMerger {
    pub fn new(sort: &[SortKey]) -> Self {
        Self { sort: sort.to_vec() }
    }

    pub fn next_step<S: MergeSource>(&self, runs: &[S]) -> MergeStep {
        if let Some(idx) = runs.iter().position(|r| r.head().is_none() && r.needs_refill()) {
            return MergeStep::Refill(idx);
        }

        let mut best: Option<(usize, &SearchEntry)> = None;
        for (idx, run) in runs.iter().enumerate() {
            let Some(head) = run.head() else { continue };
            best = match best {
                Some((best_idx, current)) if self.compare(current, best_idx, head, idx) != Ordering::Greater => {
                    Some((best_idx, current))
                }
                _ => Some((idx, head)),
            };
        }

        match best {
            Some((idx, _)) => MergeStep::Emit(idx),
            None => MergeStep::Done,
        }
    }

    /// Total order over (entry, run index) pairs.
    pub fn compare(&self, a: &SearchEntry, a_rank: usize, b: &SearchEntry, b_rank: usize) -> Ordering {
        self.compare_sort_values(&a.sort_values, &b.sort_values)
            .then_with(|| a_rank.cmp(&b_rank))
            .then_with(|| a.resource_type.cmp(&b.resource_type))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Compare two sort value tuples under the requested directions.
    pub fn compare_sort_values(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (i, key) in self.sort.iter().enumerate() {
            let left = a.get(i).unwrap_or(&Value::Null);
            let right = b.get(i).unwrap_or(&Value::Null);
            let ord = compare_values(left, right);
            let ord = match key.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn type_order(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Ascending order over JSON scalars. Missing (`Null`) sorts first.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => type_order(a).cmp(&type_order(b)),
    }
}
