//! Query execution plan.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::backend::BackendServer;
use crate::strategy::analyzer::ExecutionStrategy;

/// Why a configured server takes no part in a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    Disabled,
    Unsupported(String),
    CircuitOpen,
    /// Dropped when narrowing an expensive query to the best servers.
    NotSelected,
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::Disabled => write!(f, "disabled"),
            ExclusionReason::Unsupported(what) => write!(f, "unsupported {}", what),
            ExclusionReason::CircuitOpen => write!(f, "circuit open"),
            ExclusionReason::NotSelected => write!(f, "not selected for expensive query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedServer {
    pub server: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct QueryExecutionPlan {
    /// In rank order.
    pub selected: Vec<Arc<BackendServer>>,
    pub excluded: Vec<ExcludedServer>,
    pub strategy: ExecutionStrategy,
    pub estimated_time: Duration,
    /// Share of selected servers with performance history, 0.0..=1.0.
    pub confidence: f64,
    pub estimated_cost: f64,
}

impl QueryExecutionPlan {
    pub fn exclude(&mut self, server: &str, reason: ExclusionReason) {
        self.excluded.push(ExcludedServer {
            server: server.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn excluded_pairs(&self) -> Vec<(String, String)> {
        self.excluded
            .iter()
            .map(|e| (e.server.clone(), e.reason.clone()))
            .collect()
    }
}
