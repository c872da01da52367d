//! Metrics collection and exposition.
//!
//! # Metrics
//! - `broker_searches_total` (counter): federated searches by outcome, strategy
//! - `broker_search_duration_seconds` (histogram): end-to-end latency
//! - `broker_backend_requests_total` (counter): per-server calls by outcome
//! - `broker_backend_duration_seconds` (histogram): per-server call latency
//! - `broker_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `broker_admission_rejected_total` (counter): by reason
//! - `broker_resolution_total` (counter): distributed resolutions by kind, cache hit
//! - `broker_active_searches` (gauge)

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::circuit_breaker::CircuitState;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_search(outcome: &'static str, strategy: &'static str, start: Instant) {
    counter!("broker_searches_total", "outcome" => outcome, "strategy" => strategy).increment(1);
    histogram!("broker_search_duration_seconds", "strategy" => strategy)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_backend_call(server: &str, outcome: &'static str, elapsed: Duration) {
    counter!(
        "broker_backend_requests_total",
        "server" => server.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("broker_backend_duration_seconds", "server" => server.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_circuit_state(server: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("broker_circuit_state", "server" => server.to_string()).set(value);
}

pub fn record_admission_rejected(reason: &'static str) {
    counter!("broker_admission_rejected_total", "reason" => reason).increment(1);
}

pub fn record_resolution(kind: &'static str, cache_hit: bool) {
    counter!(
        "broker_resolution_total",
        "kind" => kind,
        "cache" => if cache_hit { "hit" } else { "miss" }
    )
    .increment(1);
}

pub fn record_active_searches(count: usize) {
    gauge!("broker_active_searches").set(count as f64);
}
