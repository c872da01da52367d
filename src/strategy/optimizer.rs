//! Cost estimation and server selection.
//!
//! # Selection
//! ```text
//! configured servers
//!     → capability filter   (excluded: unsupported ...)
//!     → enabled filter      (excluded: disabled)
//!     → circuit filter      (excluded: circuit open)
//!     → score = rating × priority, rank by priority, score, id
//!     → optional narrowing to the top K for expensive queries
//! ```
//!
//! Coefficients come from `[optimizer]` and are tuning knobs, not a contract.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::BackendServer;
use crate::config::OptimizerConfig;
use crate::health::{PerformanceMetrics, PerformanceRegistry};
use crate::query::AbstractQuery;
use crate::resilience::CircuitBreakerRegistry;
use crate::strategy::analyzer::ExecutionStrategy;
use crate::strategy::plan::{ExclusionReason, QueryExecutionPlan};

/// Rating assumed for servers without history.
const NEUTRAL_RATING: f64 = 5.0;

/// Relative cost of a query.
pub fn estimate_cost(config: &OptimizerConfig, query: &AbstractQuery) -> f64 {
    let filters: usize = query.filters.iter().map(|f| f.leaf_count()).sum();
    let chain_depth: usize = query.chains.iter().map(|c| c.depth()).sum();
    let page_factor = query.page_size as f64 / config.page_size_unit.max(1) as f64;

    config.base_cost
        + config.filter_weight * filters as f64
        + config.sort_weight * query.sort.len() as f64
        + page_factor
        + config.include_weight * query.includes.len() as f64
        + config.chain_weight * chain_depth as f64
}

struct Candidate {
    server: Arc<BackendServer>,
    history: Option<PerformanceMetrics>,
    score: f64,
}

pub struct QueryOptimizer {
    performance: Arc<PerformanceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl QueryOptimizer {
    pub fn new(performance: Arc<PerformanceRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            performance,
            breakers,
        }
    }

    pub fn plan(
        &self,
        config: &OptimizerConfig,
        query: &AbstractQuery,
        servers: &[Arc<BackendServer>],
        strategy: ExecutionStrategy,
    ) -> QueryExecutionPlan {
        let estimated_cost = estimate_cost(config, query);
        let required = query.required_params();
        let mut plan = QueryExecutionPlan {
            selected: Vec::new(),
            excluded: Vec::new(),
            strategy,
            estimated_time: Duration::ZERO,
            confidence: 0.0,
            estimated_cost,
        };

        let mut candidates = Vec::new();
        for server in servers {
            if let Err(missing) = server.supports(query.resource_type.as_deref(), &required) {
                plan.exclude(&server.id, ExclusionReason::Unsupported(missing));
                continue;
            }
            if !server.enabled {
                plan.exclude(&server.id, ExclusionReason::Disabled);
                continue;
            }
            if self.breakers.is_rejecting(&server.id) {
                plan.exclude(&server.id, ExclusionReason::CircuitOpen);
                continue;
            }
            let history = self.performance.get(&server.id);
            let rating = history.as_ref().map(|m| m.rating as f64).unwrap_or(NEUTRAL_RATING);
            candidates.push(Candidate {
                score: rating * server.priority.max(1) as f64,
                server: server.clone(),
                history,
            });
        }

        candidates.sort_by(|a, b| {
            b.server
                .priority
                .cmp(&a.server.priority)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.server.id.cmp(&b.server.id))
        });

        let limit = config.max_servers_for_expensive;
        let narrow = limit > 0
            && estimated_cost >= config.expensive_cost
            && candidates.len() > limit
            && candidates.iter().all(|c| {
                c.history
                    .as_ref()
                    .map(|m| m.total_queries >= config.min_samples)
                    .unwrap_or(false)
            });
        if narrow {
            let mut by_score: Vec<&Candidate> = candidates.iter().collect();
            by_score.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.server.id.cmp(&b.server.id))
            });
            let keep: Vec<String> = by_score.iter().take(limit).map(|c| c.server.id.clone()).collect();
            let (kept, dropped): (Vec<Candidate>, Vec<Candidate>) =
                candidates.into_iter().partition(|c| keep.contains(&c.server.id));
            for c in &dropped {
                plan.exclude(&c.server.id, ExclusionReason::NotSelected);
            }
            tracing::debug!(cost = estimated_cost, kept = kept.len(), "Narrowed expensive query");
            candidates = kept;
        }

        let default_latency = Duration::from_millis(config.default_latency_ms);
        let latencies = candidates.iter().map(|c| {
            c.history
                .as_ref()
                .filter(|m| m.total_queries > 0)
                .map(|m| Duration::from_secs_f64(m.avg_response_ms.max(0.0) / 1000.0))
                .unwrap_or(default_latency)
        });
        plan.estimated_time = match strategy {
            ExecutionStrategy::Parallel => latencies.max().unwrap_or(Duration::ZERO),
            ExecutionStrategy::Sequential => latencies.sum(),
        };

        let with_history = candidates.iter().filter(|c| c.history.is_some()).count();
        plan.confidence = if candidates.is_empty() {
            0.0
        } else {
            with_history as f64 / candidates.len() as f64
        };
        plan.selected = candidates.into_iter().map(|c| c.server).collect();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::server;
    use crate::config::CircuitBreakerConfig;
    use crate::query::{Filter, SortKey};

    fn optimizer() -> QueryOptimizer {
        QueryOptimizer::new(
            Arc::new(PerformanceRegistry::default()),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        )
    }

    fn ids(plan: &QueryExecutionPlan) -> Vec<&str> {
        plan.selected.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_cost_grows_with_query_shape() {
        let config = OptimizerConfig::default();
        let simple = AbstractQuery::new(Some("Patient"), 10);
        let richer = AbstractQuery::new(Some("Patient"), 10)
            .with_filter(Filter::eq("name", "x"))
            .with_sort(SortKey::ascending("name"));
        assert!(estimate_cost(&config, &richer) > estimate_cost(&config, &simple));
        assert!((estimate_cost(&config, &simple) - (config.base_cost + 10.0 / 50.0)).abs() < 1e-9);
    }

    #[test]
    fn test_exclusions_and_ordering() {
        let opt = optimizer();
        let mut disabled = (*server("d", 1)).clone();
        disabled.enabled = false;
        let mut limited = (*server("l", 1)).clone();
        limited.capabilities.insert("Observation".into(), vec!["*".into()]);
        opt.breakers.trip("open");

        let servers = vec![
            server("b", 1),
            Arc::new(disabled),
            Arc::new(limited),
            server("open", 1),
            server("a", 1),
            server("high", 5),
        ];
        let query = AbstractQuery::new(Some("Patient"), 10);
        let plan = opt.plan(&OptimizerConfig::default(), &query, &servers, ExecutionStrategy::Parallel);

        assert_eq!(ids(&plan), vec!["high", "a", "b"]);
        let reasons: Vec<(String, String)> = plan.excluded_pairs();
        assert!(reasons.contains(&("d".into(), "disabled".into())));
        assert!(reasons.contains(&("l".into(), "unsupported resource type Patient".into())));
        assert!(reasons.contains(&("open".into(), "circuit open".into())));
    }

    #[test]
    fn test_no_history_uses_default_latency() {
        let opt = optimizer();
        let servers = vec![server("a", 1), server("b", 1)];
        let config = OptimizerConfig::default();
        let query = AbstractQuery::new(None, 50);

        let parallel = opt.plan(&config, &query, &servers, ExecutionStrategy::Parallel);
        assert_eq!(parallel.estimated_time, Duration::from_millis(config.default_latency_ms));
        assert_eq!(parallel.confidence, 0.0);

        let sequential = opt.plan(&config, &query, &servers, ExecutionStrategy::Sequential);
        assert_eq!(sequential.estimated_time, Duration::from_millis(2 * config.default_latency_ms));
    }

    #[test]
    fn test_narrowing_requires_history_for_every_candidate() {
        let opt = optimizer();
        let config = OptimizerConfig {
            max_servers_for_expensive: 1,
            expensive_cost: 0.0,
            min_samples: 2,
            ..OptimizerConfig::default()
        };
        let servers = vec![server("fast", 1), server("slow", 1)];
        let query = AbstractQuery::new(Some("Patient"), 10);

        opt.performance.record("fast", Duration::from_millis(10), 1, true);
        opt.performance.record("fast", Duration::from_millis(10), 1, true);
        opt.performance.record("slow", Duration::from_millis(10), 0, false);
        let plan = opt.plan(&config, &query, &servers, ExecutionStrategy::Parallel);
        assert_eq!(plan.selected.len(), 2, "slow lacks enough samples");
        assert_eq!(plan.confidence, 1.0);

        opt.performance.record("slow", Duration::from_millis(10), 0, false);
        let plan = opt.plan(&config, &query, &servers, ExecutionStrategy::Parallel);
        assert_eq!(ids(&plan), vec!["fast"]);
        assert_eq!(plan.excluded_pairs(), vec![("slow".to_string(), "not selected for expensive query".to_string())]);
    }
}
