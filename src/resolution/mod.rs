//! Cross-reference resolution subsystem.
//!
//! # Data Flow
//! ```text
//! Passthrough (default): chains and includes are forwarded verbatim;
//! referenced entities are assumed to live on the same backend.
//!
//! Distributed:
//!     chained.rs → extra fan-outs resolve chains to id sets,
//!                  query rewritten with IdSet filters
//!     include.rs → after the merge, referenced / referencing entities are
//!                  fetched across all backends in id batches
//!     cache.rs   → resolved id sets kept for cache_ttl_secs
//! ```
//!
//! Every phase has its own deadline and a cap on the number of ids it may
//! produce; exceeding either fails the search as too costly. Servers that
//! fail during a phase are recorded in `ResolutionFailures` and reported as
//! degraded. A result missing any server is never cached.

pub mod cache;
pub mod chained;
pub mod include;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendRequest, BackendServer, CallLimits, SearchEntry, ServerOrchestrator};
use crate::config::ResolutionConfig;
use crate::error::{BrokerError, BrokerResult, ServerError};
use crate::observability::metrics;
use crate::query::params::{normalized_key, to_wire_params};
use crate::query::AbstractQuery;
use crate::resilience::{bounded, Interrupted};

pub use cache::ResolutionCache;
pub use chained::check_distributed_chains;

/// Servers and limits a resolution phase runs under.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    pub servers: &'a [Arc<BackendServer>],
    pub config: &'a ResolutionConfig,
    /// Per-call limits of resolution sub-queries.
    pub limits: CallLimits,
    /// Count requested per sub-query page.
    pub page_size: usize,
    /// Deadline of the whole phase.
    pub phase_timeout: Duration,
    pub cancel: &'a CancellationToken,
    pub failures: &'a ResolutionFailures,
}

/// Backend failures absorbed while resolving one search.
#[derive(Debug, Default)]
pub struct ResolutionFailures(Mutex<Vec<ServerError>>);

impl ResolutionFailures {
    fn record(&self, failures: Vec<ServerError>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(failures);
    }

    pub fn take(&self) -> Vec<ServerError> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Entries gathered by one sub-query. `complete` is false when a server
/// failed and its matches are missing.
struct Collected {
    entries: Vec<SearchEntry>,
    complete: bool,
}

enum CollectError {
    Server(ServerError),
    TooMany,
}

pub struct Resolver {
    orchestrator: Arc<ServerOrchestrator>,
    cache: Arc<ResolutionCache>,
}

impl Resolver {
    pub fn new(orchestrator: Arc<ServerOrchestrator>, cache: Arc<ResolutionCache>) -> Self {
        Self {
            orchestrator,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Run a resolution phase under its deadline.
    async fn within_phase<F, T>(&self, scope: &ResolutionScope<'_>, phase: &str, fut: F) -> BrokerResult<T>
    where
        F: std::future::Future<Output = BrokerResult<T>>,
    {
        match bounded(fut, scope.phase_timeout, scope.cancel).await {
            Ok(result) => result,
            Err(Interrupted::TimedOut(after)) => {
                tracing::warn!(phase, timeout_ms = after.as_millis() as u64, "Resolution phase timed out");
                Err(BrokerError::TooCostly(format!(
                    "{} resolution exceeded {}s",
                    phase,
                    after.as_secs()
                )))
            }
            Err(Interrupted::Cancelled) => Err(BrokerError::Cancelled),
        }
    }

    /// Every matching entry across all enabled servers, following pages.
    async fn collect(&self, scope: &ResolutionScope<'_>, query: &AbstractQuery) -> BrokerResult<Collected> {
        let params = to_wire_params(query);
        let required = query.required_params();
        let servers: Vec<&Arc<BackendServer>> = scope
            .servers
            .iter()
            .filter(|s| s.enabled && s.supports(query.resource_type.as_deref(), &required).is_ok())
            .collect();
        if servers.is_empty() {
            return Err(BrokerError::NoServersAvailable { excluded: Vec::new() });
        }

        let results = join_all(
            servers
                .iter()
                .map(|server| self.collect_from(scope, server, query.resource_type.clone(), &params)),
        )
        .await;

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(found) => {
                    for entry in found {
                        if seen.insert(entry.reference()) {
                            entries.push(entry);
                        }
                    }
                }
                Err(CollectError::TooMany) => return Err(too_many(scope)),
                Err(CollectError::Server(ServerError::Cancelled { .. })) => return Err(BrokerError::Cancelled),
                Err(CollectError::Server(e)) => failures.push(e),
            }
        }

        if failures.len() == servers.len() {
            return Err(BrokerError::AllServersFailed { failures });
        }
        if entries.len() > scope.config.max_reference_ids {
            return Err(too_many(scope));
        }

        let complete = failures.is_empty();
        if !complete {
            tracing::warn!(
                resource_type = ?query.resource_type,
                failed = failures.len(),
                "Resolution sub-query is missing servers"
            );
            scope.failures.record(failures);
        }
        Ok(Collected { entries, complete })
    }

    async fn collect_from(
        &self,
        scope: &ResolutionScope<'_>,
        server: &BackendServer,
        resource_type: Option<String>,
        params: &[(String, String)],
    ) -> Result<Vec<SearchEntry>, CollectError> {
        let mut request = BackendRequest {
            resource_type,
            params: params.to_vec(),
            count: scope.page_size,
            page_token: None,
        };
        let mut found = Vec::new();
        loop {
            let result = self
                .orchestrator
                .search(server, &request, &[], &scope.limits, scope.cancel)
                .await
                .map_err(CollectError::Server)?;
            found.extend(result.entries);
            if found.len() > scope.config.max_reference_ids {
                return Err(CollectError::TooMany);
            }
            match result.next_token {
                Some(next) => request.page_token = Some(next),
                None => return Ok(found),
            }
        }
    }

    /// `Type/id` references of every match, cached by normalized query.
    async fn collect_references(
        &self,
        scope: &ResolutionScope<'_>,
        query: &AbstractQuery,
    ) -> BrokerResult<Arc<Vec<String>>> {
        let key = normalized_key(query.resource_type.as_deref(), query);
        if let Some(hit) = self.cache.get(&key) {
            metrics::record_resolution("chain", true);
            return Ok(hit);
        }
        metrics::record_resolution("chain", false);

        let collected = self.collect(scope, query).await?;
        let refs: Vec<String> = collected.entries.iter().map(SearchEntry::reference).collect();
        if collected.complete {
            Ok(self.cache.insert(key, refs))
        } else {
            Ok(Arc::new(refs))
        }
    }
}

fn too_many(scope: &ResolutionScope<'_>) -> BrokerError {
    BrokerError::TooCostly(format!(
        "resolution produced more than {} reference ids",
        scope.config.max_reference_ids
    ))
}

/// Reference strings held by `param` in a resource: plain strings,
/// `{ "reference": ... }` objects, or arrays of either.
pub fn reference_values(resource: &Value, param: &str) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Object(object) => {
                if let Some(Value::String(r)) = object.get("reference") {
                    out.push(r.clone());
                }
            }
            Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            _ => {}
        }
    }

    let field = resource.get(param).or_else(|| {
        resource
            .as_object()
            .and_then(|o| o.iter().find(|(k, _)| k.eq_ignore_ascii_case(param)).map(|(_, v)| v))
    });
    let mut out = Vec::new();
    if let Some(value) = field {
        walk(value, &mut out);
    }
    out
}

/// `(type, id)` of a relative or absolute reference.
pub fn split_reference(reference: &str) -> Option<(&str, &str)> {
    let mut parts = reference.trim_end_matches('/').rsplitn(3, '/');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let ty = parts.next().filter(|s| !s.is_empty())?;
    Some((ty, id))
}
