//! Concurrency and memory admission.
//!
//! # Responsibilities
//! - Bound the number of searches executing at once
//! - Reserve an estimated memory footprint per search
//! - Reject immediately instead of queueing
//!
//! Both reservations are released when the returned `SearchPermit` drops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;
use crate::error::BrokerError;
use crate::observability::metrics;

/// Upper bound of result memory a search may hold:
/// one page per server, each entry at most `max_resource_size`.
pub fn estimate_memory(page_size: usize, servers: usize, max_resource_size: usize) -> usize {
    page_size
        .saturating_mul(servers.max(1))
        .saturating_mul(max_resource_size)
}

#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    memory_budget: usize,
    reserved: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(config: &LimitsConfig) -> Self {
        let max_concurrent = config.max_concurrent_searches.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            memory_budget: config.max_memory_bytes,
            reserved: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Admit a search expected to hold `memory` bytes.
    pub fn admit(&self, memory: usize) -> Result<SearchPermit, BrokerError> {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::record_admission_rejected("concurrency");
                return Err(BrokerError::TooManyConcurrentSearches {
                    limit: self.max_concurrent,
                });
            }
        };

        // A single search larger than the whole budget is still admitted
        // when nothing else holds memory.
        let reserve = memory.min(self.memory_budget);
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let available = self.memory_budget.saturating_sub(current);
            if reserve > available {
                metrics::record_admission_rejected("memory");
                return Err(BrokerError::MemoryPressure {
                    requested: memory,
                    available,
                });
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + reserve,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        metrics::record_active_searches(self.active() + 1);
        Ok(SearchPermit {
            _permit: permit,
            reserved: reserve,
            counter: self.reserved.clone(),
        })
    }

    /// Searches currently holding a permit.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn reserved_memory(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }
}

/// Admission held for the lifetime of one search.
#[derive(Debug)]
pub struct SearchPermit {
    _permit: OwnedSemaphorePermit,
    reserved: usize,
    counter: Arc<AtomicUsize>,
}

impl Drop for SearchPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.reserved, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_concurrent: usize, max_memory: usize) -> AdmissionController {
        AdmissionController::new(&LimitsConfig {
            max_concurrent_searches: max_concurrent,
            max_memory_bytes: max_memory,
            ..LimitsConfig::default()
        })
    }

    #[test]
    fn test_concurrency_rejects_immediately() {
        let admission = controller(2, 1_000);
        let a = admission.admit(10).unwrap();
        let _b = admission.admit(10).unwrap();
        assert_eq!(admission.active(), 2);

        let err = admission.admit(10).unwrap_err();
        assert!(matches!(err, BrokerError::TooManyConcurrentSearches { limit: 2 }));

        drop(a);
        assert!(admission.admit(10).is_ok());
    }

    #[test]
    fn test_memory_budget() {
        let admission = controller(10, 100);
        let a = admission.admit(60).unwrap();
        assert_eq!(admission.reserved_memory(), 60);

        match admission.admit(50).unwrap_err() {
            BrokerError::MemoryPressure { requested, available } => {
                assert_eq!(requested, 50);
                assert_eq!(available, 40);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Rejection releases the concurrency slot again.
        assert_eq!(admission.active(), 1);

        drop(a);
        assert_eq!(admission.reserved_memory(), 0);
        assert!(admission.admit(50).is_ok());
    }

    #[test]
    fn test_oversized_search_admitted_alone() {
        let admission = controller(10, 100);
        let big = admission.admit(10_000).unwrap();
        assert_eq!(admission.reserved_memory(), 100);
        assert!(admission.admit(1).is_err());
        drop(big);
    }

    #[test]
    fn test_estimate_memory() {
        assert_eq!(estimate_memory(20, 3, 1024), 20 * 3 * 1024);
        assert_eq!(estimate_memory(20, 0, 1024), 20 * 1024);
        assert_eq!(estimate_memory(usize::MAX, 2, 2), usize::MAX);
    }
}
