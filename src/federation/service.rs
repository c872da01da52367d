//! The federated search pipeline.
//!
//! One `FederatedSearch` lives for the whole process. It owns the
//! registries that must survive configuration reloads (circuit breakers,
//! performance history, resolution cache) and swaps everything else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregation::{
    AggregatedPage, AggregationEngine, ContinuationToken, ExecutionContext, ServerCursor,
};
use crate::backend::{
    servers_from_config, BackendServer, CallLimits, SearchBackend, SearchEntry, ServerOrchestrator,
};
use crate::config::{BrokerConfig, ResolutionMode};
use crate::error::{BrokerError, BrokerResult, QueryError, ServerError};
use crate::health::{HealthThresholds, PerformanceRegistry};
use crate::observability::metrics;
use crate::query::{parse_params, to_wire_params, AbstractQuery};
use crate::resilience::CircuitBreakerRegistry;
use crate::resolution::{
    check_distributed_chains, ResolutionCache, ResolutionFailures, ResolutionScope, Resolver,
};
use crate::security::{estimate_memory, AdmissionController, RateLimiter};
use crate::strategy::{analyze, ExcludedServer, ExclusionReason, ExecutionStrategy, QueryOptimizer};

/// One inbound search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Rate limiting key.
    pub client: String,
    /// `None` for a system-wide search.
    pub resource_type: Option<String>,
    pub params: Vec<(String, String)>,
}

/// A server that failed while producing this page.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedServer {
    pub server: String,
    pub kind: &'static str,
    pub message: String,
}

impl From<&ServerError> for DegradedServer {
    fn from(error: &ServerError) -> Self {
        Self {
            server: error.server().to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub search_id: Uuid,
    pub entries: Vec<SearchEntry>,
    pub included: Vec<SearchEntry>,
    /// Opaque token for the next page; absent on the last page.
    pub continuation: Option<String>,
    /// Sum of backend totals, only when every consulted server answered.
    pub total: Option<u64>,
    pub strategy: ExecutionStrategy,
    pub degraded: Vec<DegradedServer>,
    pub excluded: Vec<ExcludedServer>,
}

impl SearchResponse {
    fn empty(search_id: Uuid, strategy: ExecutionStrategy) -> Self {
        Self {
            search_id,
            entries: Vec::new(),
            included: Vec::new(),
            continuation: None,
            total: Some(0),
            strategy,
            degraded: Vec::new(),
            excluded: Vec::new(),
        }
    }
}

/// Servers a page runs against, with their cursors.
struct Participants {
    runs: Vec<(Arc<BackendServer>, ServerCursor)>,
    carried: Vec<ServerCursor>,
    excluded: Vec<ExcludedServer>,
}

pub struct FederatedSearch {
    config: ArcSwap<BrokerConfig>,
    servers: ArcSwap<Vec<Arc<BackendServer>>>,
    breakers: Arc<CircuitBreakerRegistry>,
    performance: Arc<PerformanceRegistry>,
    optimizer: QueryOptimizer,
    engine: AggregationEngine,
    resolver: Resolver,
    admission: ArcSwap<AdmissionController>,
    rate_limiter: RateLimiter,
}

impl FederatedSearch {
    pub fn new(config: BrokerConfig, backend: Arc<dyn SearchBackend>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let performance = Arc::new(PerformanceRegistry::new(HealthThresholds {
            min_success_rate: config.optimizer.healthy_success_rate,
            slow_latency: Duration::from_millis(config.optimizer.slow_latency_ms),
        }));
        let orchestrator = Arc::new(ServerOrchestrator::new(
            backend,
            breakers.clone(),
            performance.clone(),
        ));
        let cache = Arc::new(ResolutionCache::new(Duration::from_secs(
            config.resolution.cache_ttl_secs,
        )));

        Self {
            servers: ArcSwap::from_pointee(servers_from_config(&config.servers)),
            optimizer: QueryOptimizer::new(performance.clone(), breakers.clone()),
            engine: AggregationEngine::new(orchestrator.clone()),
            resolver: Resolver::new(orchestrator, cache),
            admission: ArcSwap::from_pointee(AdmissionController::new(&config.limits)),
            rate_limiter: RateLimiter::new(config.limits.max_queries_per_minute),
            config: ArcSwap::from_pointee(config),
            breakers,
            performance,
        }
    }

    /// Apply a new configuration. Breakers, performance history and cached
    /// resolutions are kept.
    pub fn reload(&self, config: BrokerConfig) {
        let current = self.config.load();
        if current.limits.max_concurrent_searches != config.limits.max_concurrent_searches
            || current.limits.max_memory_bytes != config.limits.max_memory_bytes
        {
            self.admission.store(Arc::new(AdmissionController::new(&config.limits)));
        }
        self.rate_limiter.set_limit(config.limits.max_queries_per_minute);
        self.servers.store(Arc::new(servers_from_config(&config.servers)));
        tracing::info!(servers = config.servers.len(), "Broker configuration reloaded");
        self.config.store(Arc::new(config));
    }

    pub fn config(&self) -> Arc<BrokerConfig> {
        self.config.load_full()
    }

    pub fn servers(&self) -> Arc<Vec<Arc<BackendServer>>> {
        self.servers.load_full()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn performance(&self) -> &Arc<PerformanceRegistry> {
        &self.performance
    }

    pub fn resolution_cache(&self) -> &Arc<ResolutionCache> {
        self.resolver.cache()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn active_searches(&self) -> usize {
        self.admission.load().active()
    }

    /// Run one federated search page.
    pub async fn search(
        &self,
        request: SearchRequest,
        cancel: CancellationToken,
    ) -> BrokerResult<SearchResponse> {
        let search_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "search",
            search_id = %search_id,
            client = %request.client,
            resource_type = request.resource_type.as_deref().unwrap_or("*"),
        );
        let start = Instant::now();

        let result = self.execute(search_id, request, cancel).instrument(span.clone()).await;
        span.in_scope(|| match &result {
            Ok(response) => {
                metrics::record_search("success", response.strategy.as_str(), start);
                tracing::info!(
                    entries = response.entries.len(),
                    included = response.included.len(),
                    degraded = response.degraded.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Search completed"
                );
            }
            Err(e) => {
                metrics::record_search(outcome_label(e), "none", start);
                tracing::warn!(error = %e, "Search failed");
            }
        });
        result
    }

    async fn execute(
        &self,
        search_id: Uuid,
        request: SearchRequest,
        cancel: CancellationToken,
    ) -> BrokerResult<SearchResponse> {
        let config = self.config.load_full();
        let servers = self.servers.load_full();

        self.rate_limiter.check(&request.client)?;

        let parsed = parse_params(
            request.resource_type.as_deref(),
            &request.params,
            config.query.default_page_size,
        )?;
        let query = parsed.query;
        validate_query(&config, &query)?;
        let token = match parsed.continuation.as_deref() {
            Some(raw) => {
                let token = ContinuationToken::decode(raw)?;
                token.validate(&query)?;
                Some(token)
            }
            None => None,
        };

        let memory = estimate_memory(query.page_size, servers.len(), config.limits.max_resource_size);
        let _permit = self.admission.load().admit(memory)?;

        let strategy = match &token {
            Some(token) => token.execution_strategy,
            None => analyze(&query, &config.strategy),
        };
        let deadline = Instant::now() + Duration::from_secs(config.listener.request_timeout_secs);
        let limits = CallLimits {
            default_timeout: Duration::from_secs(config.timeouts.search_secs),
            max_resource_size: config.limits.max_resource_size,
            deadline: Some(deadline),
        };
        let resolution_limits = CallLimits {
            default_timeout: Duration::from_secs(config.timeouts.chain_search_secs),
            ..limits
        };

        let resolution_failures = ResolutionFailures::default();
        let mut main = query.clone();
        if !main.chains.is_empty() && config.resolution.chained_mode == ResolutionMode::Distributed {
            let scope = ResolutionScope {
                servers: &servers,
                config: &config.resolution,
                limits: resolution_limits,
                page_size: config.query.max_results_per_server,
                phase_timeout: Duration::from_secs(config.timeouts.distributed_chain_secs),
                cancel: &cancel,
                failures: &resolution_failures,
            };
            main = match self.resolver.resolve_chains(&scope, &main).await? {
                Some(rewritten) => rewritten,
                None => {
                    let mut response = SearchResponse::empty(search_id, strategy);
                    response.degraded = resolution_failures
                        .take()
                        .iter()
                        .map(DegradedServer::from)
                        .collect();
                    if !response.degraded.is_empty() {
                        response.total = None;
                    }
                    return Ok(response);
                }
            };
        }
        let includes = match config.resolution.include_mode {
            ResolutionMode::Distributed => std::mem::take(&mut main.includes),
            ResolutionMode::Passthrough => Vec::new(),
        };

        let participants = match &token {
            Some(token) => resume(token, &servers),
            None => self.first_page(&config, &main, &servers, strategy)?,
        };
        tracing::debug!(
            strategy = strategy.as_str(),
            servers = participants.runs.len(),
            excluded = participants.excluded.len(),
            resuming = token.is_some(),
            "Search planned"
        );

        let server_page_size = token
            .as_ref()
            .map(|t| t.server_page_size)
            .filter(|n| *n > 0)
            .unwrap_or_else(|| query.page_size.min(config.query.max_results_per_server.max(1)));
        let ctx = ExecutionContext {
            resource_type: main.resource_type.clone(),
            params: to_wire_params(&main),
            sort: main.sort.clone(),
            page_size: query.page_size,
            server_page_size,
            limits,
            deduplicate: config.aggregation.deduplicate,
            dedup_boundary: token.as_ref().and_then(|t| t.dedup_boundary.clone()),
            fill_factor: config.query.fill_factor,
            cancel: cancel.clone(),
        };
        let mut page = self
            .engine
            .execute(&ctx, strategy, participants.runs, participants.carried)
            .await?;

        if !includes.is_empty() {
            let scope = ResolutionScope {
                servers: &servers,
                config: &config.resolution,
                limits: resolution_limits,
                page_size: config.query.max_results_per_server,
                phase_timeout: Duration::from_secs(config.timeouts.distributed_include_secs),
                cancel: &cancel,
                failures: &resolution_failures,
            };
            let extra = self.resolver.resolve_includes(&scope, &includes, &page.entries).await?;
            merge_included(&mut page, extra);
        }

        let failed = resolution_failures.take();
        if !failed.is_empty() {
            page.total = None;
            page.degraded.extend(failed);
        }

        let continuation = page
            .continuation
            .as_ref()
            .map(ContinuationToken::encode)
            .transpose()
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to encode continuation token");
                BrokerError::Internal(format!("continuation token: {}", e))
            })?;

        Ok(SearchResponse {
            search_id,
            continuation,
            total: page.total,
            strategy,
            degraded: page.degraded.iter().map(DegradedServer::from).collect(),
            excluded: participants.excluded,
            entries: page.entries,
            included: page.included,
        })
    }

    fn first_page(
        &self,
        config: &BrokerConfig,
        query: &AbstractQuery,
        servers: &[Arc<BackendServer>],
        strategy: ExecutionStrategy,
    ) -> BrokerResult<Participants> {
        let plan = self.optimizer.plan(&config.optimizer, query, servers, strategy);
        if plan.selected.is_empty() {
            return Err(BrokerError::NoServersAvailable {
                excluded: plan.excluded_pairs(),
            });
        }
        tracing::debug!(
            cost = plan.estimated_cost,
            confidence = plan.confidence,
            estimated_ms = plan.estimated_time.as_millis() as u64,
            "Execution plan"
        );
        Ok(Participants {
            runs: plan
                .selected
                .iter()
                .map(|s| (s.clone(), ServerCursor::fresh(s.id.clone())))
                .collect(),
            carried: Vec::new(),
            excluded: plan.excluded,
        })
    }
}

fn validate_query(config: &BrokerConfig, query: &AbstractQuery) -> Result<(), QueryError> {
    if query.page_size > config.limits.max_total_results {
        return Err(QueryError::PageSizeTooLarge {
            requested: query.page_size,
            max: config.limits.max_total_results,
        });
    }
    let depth = query.max_chain_depth();
    if depth > config.query.max_chain_depth {
        return Err(QueryError::ChainDepthExceeded {
            depth,
            max: config.query.max_chain_depth,
        });
    }
    if config.resolution.chained_mode == ResolutionMode::Distributed {
        check_distributed_chains(query)?;
    }
    Ok(())
}

/// Cursors of a continuation token, in token order. Servers that were
/// removed or disabled since the token was issued are closed out.
fn resume(token: &ContinuationToken, servers: &[Arc<BackendServer>]) -> Participants {
    let mut participants = Participants {
        runs: Vec::new(),
        carried: Vec::new(),
        excluded: Vec::new(),
    };
    for cursor in &token.servers {
        if cursor.exhausted {
            participants.carried.push(cursor.clone());
            continue;
        }
        match servers.iter().find(|s| s.id == cursor.endpoint) {
            Some(server) if server.enabled => {
                participants.runs.push((server.clone(), cursor.clone()))
            }
            found => {
                let reason = match found {
                    Some(_) => ExclusionReason::Disabled.to_string(),
                    None => "removed from configuration".to_string(),
                };
                tracing::warn!(server = %cursor.endpoint, reason = %reason, "Dropping server from resumed scan");
                participants.excluded.push(ExcludedServer {
                    server: cursor.endpoint.clone(),
                    reason,
                });
                participants.carried.push(ServerCursor {
                    exhausted: true,
                    token: None,
                    page_token: None,
                    page_offset: 0,
                    ..cursor.clone()
                });
            }
        }
    }
    participants
}

fn merge_included(page: &mut AggregatedPage, extra: Vec<SearchEntry>) {
    for entry in extra {
        let reference = entry.reference();
        if !page.included.iter().any(|e| e.reference() == reference) {
            page.included.push(entry);
        }
    }
}

fn outcome_label(error: &BrokerError) -> &'static str {
    match error {
        BrokerError::RateLimited { .. }
        | BrokerError::TooManyConcurrentSearches { .. }
        | BrokerError::MemoryPressure { .. } => "rejected",
        BrokerError::Invalid(_) => "invalid",
        BrokerError::TooCostly(_) => "too_costly",
        BrokerError::NoServersAvailable { .. } | BrokerError::AllServersFailed { .. } => "unavailable",
        BrokerError::Cancelled => "cancelled",
        BrokerError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{entry, param, FakeBackend};
    use crate::backend::{BackendFailure, WireEntry};
    use crate::config::ServerConfig;
    use serde_json::json;
    use std::collections::HashMap;

    fn server_config(id: &str, priority: u32) -> ServerConfig {
        ServerConfig {
            id: id.into(),
            name: String::new(),
            base_url: format!("http://{}.test/", id),
            enabled: true,
            priority,
            auth: Default::default(),
            timeout_secs: None,
            headers: HashMap::new(),
            capabilities: HashMap::new(),
        }
    }

    fn broker(backend: FakeBackend, servers: &[&str]) -> FederatedSearch {
        let mut config = BrokerConfig::default();
        config.servers = servers.iter().map(|id| server_config(id, 1)).collect();
        FederatedSearch::new(config, Arc::new(backend))
    }

    fn request(resource_type: &str, params: &[(&str, &str)]) -> SearchRequest {
        SearchRequest {
            client: "test".into(),
            resource_type: Some(resource_type.into()),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn named(id: &str, name: &str) -> WireEntry {
        entry("Patient", id, json!({ "name": name }))
    }

    fn ids(response: &SearchResponse) -> Vec<&str> {
        response.entries.iter().map(|e| e.id.as_str()).collect()
    }

    fn sorted_backend() -> FakeBackend {
        FakeBackend::fixed(vec![
            ("a", vec![named("1", "Alice"), named("3", "Carol")]),
            ("b", vec![named("2", "Bob"), named("4", "Eve")]),
        ])
    }

    #[tokio::test]
    async fn test_sorted_search_with_continuation() {
        let broker = broker(sorted_backend(), &["a", "b"]);

        let first = broker
            .search(request("Patient", &[("_sort", "name"), ("_count", "2")]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&first), vec!["1", "2"]);
        assert_eq!(first.strategy, ExecutionStrategy::Parallel);
        let token = first.continuation.clone().unwrap();

        let second = broker
            .search(
                request("Patient", &[("_sort", "name"), ("_count", "2"), ("_continuation", &token)]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ids(&second), vec!["3", "4"]);
        assert!(second.continuation.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_token_rejected() {
        let broker = broker(sorted_backend(), &["a", "b"]);
        let first = broker
            .search(request("Patient", &[("_sort", "name"), ("_count", "2")]), CancellationToken::new())
            .await
            .unwrap();
        let token = first.continuation.unwrap();

        let err = broker
            .search(
                request("Patient", &[("_sort", "-name"), ("_count", "2"), ("_continuation", &token)]),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Invalid(QueryError::TokenMismatch(_))));

        let err = broker
            .search(request("Patient", &[("_continuation", "!!garbage")]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Invalid(QueryError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_validation_limits() {
        let broker = broker(sorted_backend(), &["a"]);

        let err = broker
            .search(request("Patient", &[("_count", "5000")]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Invalid(QueryError::PageSizeTooLarge { .. })));

        let err = broker
            .search(
                request("Observation", &[("a.b.c.d.name", "x")]),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Invalid(QueryError::ChainDepthExceeded { depth: 4, max: 3 })));
    }

    #[tokio::test]
    async fn test_partial_failure_is_degraded() {
        let broker = broker(
            FakeBackend::new(|server, _| match server.id.as_str() {
                "bad" => Err(BackendFailure::Unreachable("refused".into())),
                _ => Ok(vec![named("1", "Alice")]),
            }),
            &["good", "bad"],
        );

        let response = broker
            .search(request("Patient", &[]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&response), vec!["1"]);
        assert_eq!(response.degraded.len(), 1);
        assert_eq!(response.degraded[0].server, "bad");
        assert_eq!(response.degraded[0].kind, "unreachable");
        assert_eq!(response.total, None);
    }

    #[tokio::test]
    async fn test_all_servers_failing() {
        let broker = broker(
            FakeBackend::new(|_, _| Err(BackendFailure::UnexpectedResponse("status 500".into()))),
            &["a", "b"],
        );
        let err = broker
            .search(request("Patient", &[]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AllServersFailed { ref failures } if failures.len() == 2));
    }

    #[tokio::test]
    async fn test_no_servers_when_all_disabled() {
        let mut config = BrokerConfig::default();
        let mut disabled = server_config("a", 1);
        disabled.enabled = false;
        config.servers = vec![disabled];
        let broker = FederatedSearch::new(config, Arc::new(sorted_backend()));

        match broker.search(request("Patient", &[]), CancellationToken::new()).await {
            Err(BrokerError::NoServersAvailable { excluded }) => {
                assert_eq!(excluded, vec![("a".to_string(), "disabled".to_string())]);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.entries.len())),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_backends() {
        let backend = Arc::new(sorted_backend());
        let mut config = BrokerConfig::default();
        config.servers = vec![server_config("a", 1)];
        config.limits.max_queries_per_minute = 1;
        let broker = FederatedSearch::new(config, backend.clone());

        broker.search(request("Patient", &[]), CancellationToken::new()).await.unwrap();
        let err = broker
            .search(request("Patient", &[]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::RateLimited { .. }));
        assert!(err.retry_after().is_some());
        assert_eq!(backend.calls_to("a"), 1);
    }

    #[tokio::test]
    async fn test_distributed_chain_without_matches_skips_main_query() {
        let backend = Arc::new(FakeBackend::new(|_, request| {
            if request.resource_type.as_deref() == Some("Patient") {
                Ok(Vec::new())
            } else {
                Ok(vec![entry("Observation", "x1", json!({}))])
            }
        }));
        let mut config = BrokerConfig::default();
        config.servers = vec![server_config("a", 1)];
        config.resolution.chained_mode = ResolutionMode::Distributed;
        let broker = FederatedSearch::new(config, backend.clone());

        let response = broker
            .search(request("Observation", &[("subject:Patient.name", "nobody")]), CancellationToken::new())
            .await
            .unwrap();
        assert!(response.entries.is_empty());
        assert_eq!(response.total, Some(0));
        assert!(backend
            .calls()
            .iter()
            .all(|(_, r)| r.resource_type.as_deref() == Some("Patient")));
    }

    #[tokio::test]
    async fn test_distributed_chain_failure_is_degraded() {
        let backend = Arc::new(FakeBackend::new(|server, request| {
            match (server.id.as_str(), request.resource_type.as_deref()) {
                ("a", Some("Patient")) => Ok(vec![entry("Patient", "p1", json!({}))]),
                ("b", Some("Patient")) => Err(BackendFailure::Unreachable("refused".into())),
                ("a", _) => Ok(vec![entry("Observation", "x1", json!({}))]),
                _ => Ok(Vec::new()),
            }
        }));
        let mut config = BrokerConfig::default();
        config.servers = vec![server_config("a", 1), server_config("b", 1)];
        config.resolution.chained_mode = ResolutionMode::Distributed;
        let broker = FederatedSearch::new(config, backend);

        let response = broker
            .search(request("Observation", &[("subject:Patient.name", "x")]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids(&response), vec!["x1"]);
        assert_eq!(response.degraded.len(), 1);
        assert_eq!(response.degraded[0].server, "b");
        assert_eq!(response.degraded[0].kind, "unreachable");
        assert_eq!(response.total, None);
        assert!(broker.resolution_cache().is_empty());
    }

    #[tokio::test]
    async fn test_distributed_include_stripped_and_fetched() {
        let backend = Arc::new(FakeBackend::new(|server, request| {
            Ok(match (server.id.as_str(), request.resource_type.as_deref()) {
                ("a", Some("Patient")) => vec![entry(
                    "Patient",
                    "p1",
                    json!({"managingOrganization": {"reference": "Organization/o1"}}),
                )],
                ("b", Some("Organization")) if param(request, "_id") == Some("o1") => {
                    vec![entry("Organization", "o1", json!({}))]
                }
                _ => Vec::new(),
            })
        }));
        let mut config = BrokerConfig::default();
        config.servers = vec![server_config("a", 1), server_config("b", 1)];
        config.resolution.include_mode = ResolutionMode::Distributed;
        let broker = FederatedSearch::new(config, backend.clone());

        let response = broker
            .search(
                request("Patient", &[("_include", "Patient:managingOrganization")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ids(&response), vec!["p1"]);
        assert_eq!(response.included.len(), 1);
        assert_eq!(response.included[0].reference(), "Organization/o1");
        assert!(backend
            .calls()
            .iter()
            .all(|(_, r)| param(r, "_include").is_none()));
    }

    #[tokio::test]
    async fn test_resume_closes_out_removed_server() {
        let broker = broker(sorted_backend(), &["a", "b"]);
        let first = broker
            .search(request("Patient", &[("_sort", "name"), ("_count", "2")]), CancellationToken::new())
            .await
            .unwrap();
        let token = first.continuation.unwrap();

        let mut config = BrokerConfig::default();
        config.servers = vec![server_config("a", 1)];
        broker.reload(config);

        let second = broker
            .search(
                request("Patient", &[("_sort", "name"), ("_count", "2"), ("_continuation", &token)]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ids(&second), vec!["3"]);
        assert_eq!(second.excluded.len(), 1);
        assert_eq!(second.excluded[0].server, "b");
        assert!(second.continuation.is_none());
    }
}
