//! Per-server performance tracking.
//!
//! Each completed attempt (success or failure) updates an exponential moving
//! average of latency, the running success rate, and a 1–10 rating used by
//! the optimizer. Entries are created on first use and never reset.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Weight of the newest sample in the latency average.
const LATENCY_ALPHA: f64 = 0.2;

/// Thresholds deciding the health flag and the latency component of the rating.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub min_success_rate: f64,
    pub slow_latency: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            slow_latency: Duration::from_secs(5),
        }
    }
}

/// Snapshot of one server's observed performance.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceMetrics {
    pub avg_response_ms: f64,
    pub success_rate: f64,
    pub total_queries: u64,
    pub successful_queries: u64,
    pub total_results: u64,
    pub healthy: bool,
    pub rating: u8,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            avg_response_ms: 0.0,
            success_rate: 1.0,
            total_queries: 0,
            successful_queries: 0,
            total_results: 0,
            healthy: true,
            rating: 5,
        }
    }
}

impl PerformanceMetrics {
    fn record(&mut self, elapsed: Duration, results: usize, success: bool, thresholds: HealthThresholds) {
        let sample_ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_ms = if self.total_queries == 0 {
            sample_ms
        } else {
            LATENCY_ALPHA * sample_ms + (1.0 - LATENCY_ALPHA) * self.avg_response_ms
        };

        self.total_queries += 1;
        if success {
            self.successful_queries += 1;
            self.total_results += results as u64;
        }
        self.success_rate = self.successful_queries as f64 / self.total_queries as f64;

        let slow_ms = thresholds.slow_latency.as_secs_f64() * 1000.0;
        self.healthy = self.success_rate >= thresholds.min_success_rate && self.avg_response_ms <= slow_ms;
        self.rating = rate(self.success_rate, self.avg_response_ms, slow_ms);
    }
}

/// 70% reliability, 30% speed, mapped onto 1..=10.
fn rate(success_rate: f64, avg_ms: f64, slow_ms: f64) -> u8 {
    let speed = if slow_ms > 0.0 {
        1.0 - (avg_ms / slow_ms).min(1.0)
    } else {
        0.0
    };
    let score = 0.7 * success_rate + 0.3 * speed;
    (1.0 + score * 9.0).round().clamp(1.0, 10.0) as u8
}

/// Process-wide performance map keyed by server id.
#[derive(Debug, Default)]
pub struct PerformanceRegistry {
    servers: DashMap<String, Arc<Mutex<PerformanceMetrics>>>,
    thresholds: HealthThresholds,
}

impl PerformanceRegistry {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            servers: DashMap::new(),
            thresholds,
        }
    }

    fn entry(&self, server_id: &str) -> Arc<Mutex<PerformanceMetrics>> {
        if let Some(existing) = self.servers.get(server_id) {
            return existing.clone();
        }
        self.servers
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Record one completed attempt.
    pub fn record(&self, server_id: &str, elapsed: Duration, results: usize, success: bool) {
        let entry = self.entry(server_id);
        let mut metrics = entry.lock().unwrap_or_else(|p| p.into_inner());
        metrics.record(elapsed, results, success, self.thresholds);
        if !metrics.healthy {
            tracing::debug!(
                server = %server_id,
                success_rate = metrics.success_rate,
                avg_ms = metrics.avg_response_ms,
                "Server below health thresholds"
            );
        }
    }

    /// Current metrics, or `None` when the server has never been queried.
    pub fn get(&self, server_id: &str) -> Option<PerformanceMetrics> {
        self.servers
            .get(server_id)
            .map(|entry| entry.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    pub fn snapshot(&self) -> Vec<(String, PerformanceMetrics)> {
        let mut all: Vec<_> = self
            .servers
            .iter()
            .map(|e| (e.key().clone(), e.value().lock().unwrap_or_else(|p| p.into_inner()).clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
