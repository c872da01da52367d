//! Execution strategy analyzer.
//!
//! # Rules (first match wins)
//! ```text
//! any sort key                 → Parallel   (global order needs every stream)
//! page_size <= small threshold → Parallel
//! page_size >  large threshold → Sequential (drain servers in rank order)
//! otherwise                    → Parallel
//! ```

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::query::AbstractQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Parallel,
    Sequential,
}

impl ExecutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Sequential => "sequential",
        }
    }
}

/// Classify a query. Pure: depends only on the query and the thresholds.
pub fn analyze(query: &AbstractQuery, thresholds: &StrategyConfig) -> ExecutionStrategy {
    if !query.sort.is_empty() {
        return ExecutionStrategy::Parallel;
    }
    if query.page_size <= thresholds.small_page_threshold {
        return ExecutionStrategy::Parallel;
    }
    if query.page_size > thresholds.large_page_threshold {
        return ExecutionStrategy::Sequential;
    }
    ExecutionStrategy::Parallel
}
