//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the broker.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the federated search broker.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Backend resource servers participating in federation.
    pub servers: Vec<ServerConfig>,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Query validation and fan-out limits.
    pub query: QueryConfig,

    /// Execution strategy thresholds.
    pub strategy: StrategyConfig,

    /// Per-server circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Resource protection limits applied at admission.
    pub limits: LimitsConfig,

    /// Chained / include resolution settings.
    pub resolution: ResolutionConfig,

    /// Result aggregation policy.
    pub aggregation: AggregationConfig,

    /// Cost estimator coefficients and server narrowing.
    pub optimizer: OptimizerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Total time allowed for one inbound request, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Backend server definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique server identifier. Circuit and performance state is keyed by it.
    pub id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Base URL of the server's search API.
    pub base_url: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Priority weight (higher = preferred, queried first in sequential mode).
    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Per-server search timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Extra static headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Advertised search parameters per resource type.
    /// An empty map means the server supports every parameter.
    #[serde(default)]
    pub capabilities: HashMap<String, Vec<String>>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u32 {
    1
}

/// Authentication attached to outbound backend calls.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Header {
        name: String,
        value: String,
    },
}

/// Timeout configuration for backend calls, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default per-server search timeout.
    pub search_secs: u64,

    /// Per-server timeout for individual chained resolution sub-queries.
    pub chain_search_secs: u64,

    /// Overall budget for a distributed chain resolution phase.
    pub distributed_chain_secs: u64,

    /// Overall budget for a distributed include resolution phase.
    pub distributed_include_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            search_secs: 30,
            chain_search_secs: 10,
            distributed_chain_secs: 15,
            distributed_include_secs: 15,
        }
    }
}

/// Query validation and fan-out limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Maximum number of nested forward-chain links.
    pub max_chain_depth: usize,

    /// Page size used when the client does not send `_count`.
    pub default_page_size: usize,

    /// Upper bound on entries requested from a single server per call.
    pub max_results_per_server: usize,

    /// Share of the page a sequential fan-out must fill before it may stop
    /// consulting further servers (1.0 = fill completely).
    pub fill_factor: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: 3,
            default_page_size: 20,
            max_results_per_server: 100,
            fill_factor: 1.0,
        }
    }
}

/// Thresholds for the parallel/sequential classification.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Page sizes at or below this always run in parallel.
    pub small_page_threshold: usize,

    /// Page sizes strictly above this run sequentially.
    pub large_page_threshold: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            small_page_threshold: 10,
            large_page_threshold: 20,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Seconds an open circuit rejects calls before allowing a trial.
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Resource protection limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Estimated in-flight result memory budget across all searches.
    pub max_memory_bytes: usize,

    /// Maximum searches executing at once.
    pub max_concurrent_searches: usize,

    /// Largest page a client may request.
    pub max_total_results: usize,

    /// Entries whose payload exceeds this many bytes are dropped.
    pub max_resource_size: usize,

    /// Per-client sliding-window rate limit. Zero disables it.
    pub max_queries_per_minute: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            max_concurrent_searches: 64,
            max_total_results: 1000,
            max_resource_size: 1024 * 1024,
            max_queries_per_minute: 600,
        }
    }
}

/// How cross-reference clauses are resolved.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Forward the clause verbatim; each backend resolves it locally.
    #[default]
    Passthrough,
    /// Resolve across all backends first, then rewrite as an id filter.
    Distributed,
}

/// Chained / include resolution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub chained_mode: ResolutionMode,
    pub include_mode: ResolutionMode,

    /// Maximum ids a distributed resolution may produce.
    pub max_reference_ids: usize,

    /// Ids per outbound resolution request.
    pub batch_size: usize,

    /// Lifetime of cached resolution results. Zero disables the cache.
    pub cache_ttl_secs: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            chained_mode: ResolutionMode::Passthrough,
            include_mode: ResolutionMode::Passthrough,
            max_reference_ids: 1000,
            batch_size: 100,
            cache_ttl_secs: 60,
        }
    }
}

/// Aggregation policy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AggregationConfig {
    /// Drop entries whose identity was already emitted on the same page.
    pub deduplicate: bool,
}

/// Cost estimator coefficients and narrowing policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub base_cost: f64,
    pub filter_weight: f64,
    pub sort_weight: f64,
    pub include_weight: f64,
    pub chain_weight: f64,
    /// Page size that adds one unit of cost.
    pub page_size_unit: usize,

    /// Cost at or above which a query is treated as expensive.
    pub expensive_cost: f64,

    /// Narrow expensive queries to this many top-scoring servers. Zero disables narrowing.
    pub max_servers_for_expensive: usize,

    /// Recorded queries a server needs before its rating is trusted.
    pub min_samples: u64,

    /// Latency assumed for servers without history, in milliseconds.
    pub default_latency_ms: u64,

    /// Success rate below which a server is flagged unhealthy.
    pub healthy_success_rate: f64,

    /// Average latency above which a server is flagged unhealthy, in milliseconds.
    pub slow_latency_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            base_cost: 1.0,
            filter_weight: 0.5,
            sort_weight: 1.0,
            include_weight: 2.0,
            chain_weight: 3.0,
            page_size_unit: 50,
            expensive_cost: 8.0,
            max_servers_for_expensive: 0,
            min_samples: 5,
            default_latency_ms: 500,
            healthy_success_rate: 0.8,
            slow_latency_ms: 5000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive (trace, debug, info, warn, error, or EnvFilter syntax).
    pub log_level: String,

    /// Use the compact single-line log format.
    pub compact_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            compact_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin endpoints.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,

    /// Maximum entries examined per map in one sweep.
    pub sweep_limit: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            sweep_limit: 10_000,
        }
    }
}
