//! Per-server call orchestration.
//!
//! # Call path
//! ```text
//! search(server, request)
//!     → cancellation and search deadline (outside the breaker: a call
//!       cut short by either is neither a success nor a failure)
//!     → server's CircuitBreaker::execute
//!         → per-server timeout (inside: a timeout is a failure)
//!         → SearchBackend::search
//!     → PerformanceRegistry + metrics
//!     → ServerSearchResult (oversized entries dropped, sort values extracted)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::backend::client::{
    BackendFailure, BackendRequest, EntryMode, SearchBackend, SearchEntry, ServerSearchResult,
    WirePage,
};
use crate::backend::server::BackendServer;
use crate::error::ServerError;
use crate::health::PerformanceRegistry;
use crate::observability::metrics;
use crate::query::SortKey;
use crate::resilience::{until_deadline, CircuitBreakerRegistry, CircuitError, Interrupted};

/// Limits applied to every call of one search.
#[derive(Debug, Clone, Copy)]
pub struct CallLimits {
    /// Used when the server has no timeout override.
    pub default_timeout: Duration,
    /// Entries whose serialized payload exceeds this are dropped.
    pub max_resource_size: usize,
    /// Overall deadline of the enclosing search, if any.
    pub deadline: Option<Instant>,
}

pub struct ServerOrchestrator {
    backend: Arc<dyn SearchBackend>,
    breakers: Arc<CircuitBreakerRegistry>,
    performance: Arc<PerformanceRegistry>,
}

impl ServerOrchestrator {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        breakers: Arc<CircuitBreakerRegistry>,
        performance: Arc<PerformanceRegistry>,
    ) -> Self {
        Self {
            backend,
            breakers,
            performance,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn performance(&self) -> &Arc<PerformanceRegistry> {
        &self.performance
    }

    /// Execute one sub-query against one server.
    pub async fn search(
        &self,
        server: &BackendServer,
        request: &BackendRequest,
        sort: &[SortKey],
        limits: &CallLimits,
        cancel: &CancellationToken,
    ) -> Result<ServerSearchResult, ServerError> {
        let timeout = server.timeout.unwrap_or(limits.default_timeout);
        let breaker = self.breakers.get(&server.id);
        let start = Instant::now();

        let call = breaker.execute(|| async {
            match tokio::time::timeout(timeout, self.backend.search(server, request)).await {
                Ok(Ok(page)) => Ok(page),
                Ok(Err(failure)) => Err(classify(&server.id, failure)),
                Err(_) => Err(ServerError::Timeout {
                    server: server.id.clone(),
                    after: timeout,
                }),
            }
        });

        let outcome = match until_deadline(call, limits.deadline, cancel).await {
            Ok(outcome) => outcome,
            Err(Interrupted::Cancelled) => {
                tracing::debug!(server = %server.id, "Backend call cancelled");
                metrics::record_backend_call(&server.id, "cancelled", start.elapsed());
                return Err(ServerError::Cancelled {
                    server: server.id.clone(),
                });
            }
            // The search ran out of time, not the server.
            Err(Interrupted::TimedOut(_)) => {
                let elapsed = start.elapsed();
                tracing::debug!(server = %server.id, "Search deadline reached during backend call");
                metrics::record_backend_call(&server.id, "deadline", elapsed);
                return Err(ServerError::Timeout {
                    server: server.id.clone(),
                    after: elapsed,
                });
            }
        };
        let elapsed = start.elapsed();

        match outcome {
            Ok(page) => {
                let result = self.into_result(server, page, sort, limits.max_resource_size);
                self.performance
                    .record(&server.id, elapsed, result.entries.len(), true);
                metrics::record_backend_call(&server.id, "success", elapsed);
                tracing::debug!(
                    server = %server.id,
                    entries = result.entries.len(),
                    exhausted = result.is_exhausted(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Backend search completed"
                );
                Ok(result)
            }
            Err(CircuitError::Open { retry_after }) => {
                metrics::record_backend_call(&server.id, "circuit_open", elapsed);
                Err(ServerError::CircuitOpen {
                    server: server.id.clone(),
                    retry_after,
                })
            }
            Err(CircuitError::Inner(error)) => {
                self.performance.record(&server.id, elapsed, 0, false);
                metrics::record_backend_call(&server.id, error.kind(), elapsed);
                tracing::warn!(server = %server.id, error = %error, "Backend search failed");
                Err(error)
            }
        }
    }

    fn into_result(
        &self,
        server: &BackendServer,
        page: WirePage,
        sort: &[SortKey],
        max_resource_size: usize,
    ) -> ServerSearchResult {
        let mut entries = Vec::with_capacity(page.entries.len());
        let mut included = Vec::new();

        for wire in page.entries {
            let size = serde_json::to_vec(&wire.resource).map(|b| b.len()).unwrap_or(0);
            if size > max_resource_size {
                tracing::warn!(
                    server = %server.id,
                    resource_type = %wire.resource_type,
                    id = %wire.id,
                    size,
                    "Dropping oversized resource"
                );
                continue;
            }
            let mode = wire.mode;
            let entry = SearchEntry::from_wire(wire, sort);
            match mode {
                EntryMode::Match => entries.push(entry),
                EntryMode::Include => included.push(entry),
            }
        }

        ServerSearchResult {
            server_id: server.id.clone(),
            entries,
            included,
            next_token: page.next,
            total: page.total,
        }
    }
}

fn classify(server: &str, failure: BackendFailure) -> ServerError {
    match failure {
        BackendFailure::Unreachable(reason) => ServerError::Unreachable {
            server: server.to_string(),
            reason,
        },
        BackendFailure::UnexpectedResponse(reason) => ServerError::UnexpectedResponse {
            server: server.to_string(),
            reason,
        },
    }
}
