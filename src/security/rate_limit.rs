//! Per-client sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::BrokerError;
use crate::observability::metrics;

const WINDOW: Duration = Duration::from_secs(60);

/// Admits at most `max_per_minute` searches per client in any trailing
/// 60 second window.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_per_minute: AtomicU32,
}

impl RateLimiter {
    /// Zero disables limiting.
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_per_minute: AtomicU32::new(max_per_minute),
        }
    }

    /// Applies to the next check. Existing windows are kept.
    pub fn set_limit(&self, max_per_minute: u32) {
        self.max_per_minute.store(max_per_minute, Ordering::Relaxed);
    }

    pub fn check(&self, client: &str) -> Result<(), BrokerError> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> Result<(), BrokerError> {
        let max = self.max_per_minute.load(Ordering::Relaxed);
        if max == 0 {
            return Ok(());
        }

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(client.to_string()).or_default();
        while window.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
            window.pop_front();
        }

        if window.len() >= max as usize {
            let retry_after = window
                .front()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(WINDOW);
            tracing::warn!(client = %client, "Rate limit exceeded");
            metrics::record_admission_rejected("rate_limit");
            return Err(BrokerError::RateLimited {
                client: client.to_string(),
                retry_after,
            });
        }

        window.push_back(now);
        Ok(())
    }

    /// Drop up to `limit` clients whose window holds no recent queries.
    pub fn sweep(&self, limit: usize) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let idle: Vec<String> = windows
            .iter()
            .filter(|(_, w)| w.back().map_or(true, |t| now.duration_since(*t) >= WINDOW))
            .take(limit)
            .map(|(client, _)| client.clone())
            .collect();
        for client in &idle {
            windows.remove(client);
        }
        idle.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
