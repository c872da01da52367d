//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: exactly one trial request is allowed through
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures since last success >= threshold
//! Open → Half-Open: first call after the cooldown deadline
//! Half-Open → Closed: trial succeeds (failure count reset)
//! Half-Open → Open: trial fails (fresh cooldown deadline)
//! ```
//!
//! One breaker per server, each behind its own mutex. Reads are snapshots;
//! only `record_success`, `record_failure`, `trip` and `reset` mutate.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left before an open circuit admits a trial call.
    pub retry_after_ms: Option<u64>,
}

/// Outcome of `CircuitBreaker::execute`.
#[derive(Debug)]
pub enum CircuitError<E> {
    /// Rejected without attempting the operation.
    Open { retry_after: Duration },
    /// The operation ran and failed; the failure has been recorded.
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state. Does not advance Open to Half-Open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_after_ms: match inner.state {
                CircuitState::Open => inner
                    .open_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }

    /// Run `op` if the circuit admits it, recording the outcome.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = self
            .try_acquire(Instant::now())
            .map_err(|retry_after| CircuitError::Open { retry_after })?;
        let mut guard = TrialGuard { breaker: self, trial, settled: false };

        let result = op().await;
        guard.settled = true;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Admit or reject a call at `now`. `Ok(true)` marks the half-open trial.
    fn try_acquire(&self, now: Instant) -> Result<bool, Duration> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => match inner.open_until {
                Some(until) if now < until => Err(until - now),
                _ => {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    drop(inner);
                    tracing::info!(server = %self.name, "Circuit half-open, admitting trial request");
                    metrics::record_circuit_state(&self.name, CircuitState::HalfOpen);
                    Ok(true)
                }
            },
            CircuitState::HalfOpen if inner.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.trial_in_flight = false;
        drop(inner);

        if previous != CircuitState::Closed {
            tracing::info!(server = %self.name, from = ?previous, "Circuit closed");
            metrics::record_circuit_state(&self.name, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;

        let opens = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if !opens {
            return;
        }

        let previous = inner.state;
        inner.state = CircuitState::Open;
        inner.open_until = Some(now + self.cooldown);
        let failures = inner.consecutive_failures;
        drop(inner);

        tracing::warn!(
            server = %self.name,
            from = ?previous,
            failures,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "Circuit opened"
        );
        metrics::record_circuit_state(&self.name, CircuitState::Open);
    }

    /// Force the circuit open for one cooldown period.
    pub fn trip(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + self.cooldown);
        inner.trial_in_flight = false;
        drop(inner);
        tracing::warn!(server = %self.name, "Circuit tripped manually");
        metrics::record_circuit_state(&self.name, CircuitState::Open);
    }

    /// Force the circuit closed and clear the failure count.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.trial_in_flight = false;
        drop(inner);
        tracing::info!(server = %self.name, "Circuit reset manually");
        metrics::record_circuit_state(&self.name, CircuitState::Closed);
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }
}

/// Frees the half-open trial slot if the guarded call is dropped before
/// reporting an outcome (cancellation).
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

/// Process-wide map of breakers keyed by server id, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get(&self, server_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(server_id) {
            return existing.clone();
        }
        self.breakers
            .entry(server_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    server_id,
                    self.config.failure_threshold,
                    Duration::from_secs(self.config.cooldown_secs),
                ))
            })
            .clone()
    }

    /// State of a server's breaker; servers never called are Closed.
    pub fn state(&self, server_id: &str) -> CircuitState {
        self.breakers
            .get(server_id)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// True when the server's circuit is open and still cooling down.
    pub fn is_rejecting(&self, server_id: &str) -> bool {
        self.breakers
            .get(server_id)
            .map(|b| {
                let snapshot = b.snapshot();
                snapshot.state == CircuitState::Open && snapshot.retry_after_ms.unwrap_or(0) > 0
            })
            .unwrap_or(false)
    }

    pub fn snapshot(&self, server_id: &str) -> CircuitSnapshot {
        self.get(server_id).snapshot()
    }

    pub fn trip(&self, server_id: &str) {
        self.get(server_id).trip();
    }

    pub fn reset(&self, server_id: &str) {
        self.get(server_id).reset();
    }

    /// Re-export every breaker's state as a gauge.
    pub fn publish_states(&self) {
        for entry in self.breakers.iter() {
            metrics::record_circuit_state(entry.key(), entry.value().state());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_millis(cooldown_ms))
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CircuitError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test]
    async fn test_opens_exactly_at_threshold() {
        let b = breaker(3, 60_000);
        assert!(matches!(fail(&b).await, Err(CircuitError::Inner("boom"))));
        assert!(matches!(fail(&b).await, Err(CircuitError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(matches!(fail(&b).await, Err(CircuitError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Open);

        // Rejected without attempting.
        let mut attempted = false;
        let result = b
            .execute(|| {
                attempted = true;
                async { Ok::<_, &'static str>(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitError::Open { .. })));
        assert!(!attempted);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let b = breaker(2, 60_000);
        let _ = fail(&b).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let b = breaker(1, 20);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Reading state does not advance the machine.
        assert_eq!(b.state(), CircuitState::Open);

        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let b = breaker(1, 30);
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(fail(&b).await, Err(CircuitError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Open);
        let retry = b.snapshot().retry_after_ms.unwrap();
        assert!(retry > 0 && retry <= 30);
        assert!(matches!(succeed(&b).await, Err(CircuitError::Open { .. })));
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let b = breaker(1, 0);
        b.record_failure_at(Instant::now());
        let now = Instant::now();
        assert_eq!(b.try_acquire(now), Ok(true));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire(now).is_err());

        // A dropped trial frees the slot without changing state.
        b.release_trial();
        assert_eq!(b.try_acquire(now), Ok(true));
    }

    #[tokio::test]
    async fn test_manual_trip_and_reset() {
        let b = breaker(5, 60_000);
        b.trip();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(succeed(&b).await, Err(CircuitError::Open { .. })));
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(succeed(&b).await.is_ok());
    }

    #[test]
    fn test_registry_is_lazy_and_independent() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_secs: 60,
        });
        assert_eq!(registry.state("a"), CircuitState::Closed);
        registry.trip("a");
        assert_eq!(registry.state("a"), CircuitState::Open);
        assert!(registry.is_rejecting("a"));
        assert_eq!(registry.state("b"), CircuitState::Closed);
        assert!(Arc::ptr_eq(&registry.get("a"), &registry.get("a")));
    }
}
