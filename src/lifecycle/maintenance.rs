//! Periodic background maintenance.
//!
//! # Responsibilities
//! - Sweep expired resolution-cache entries
//! - Drop idle rate-limiter windows
//! - Refresh circuit-state gauges
//!
//! Each sweep examines a bounded number of entries so a tick never stalls.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::config::MaintenanceConfig;
use crate::federation::FederatedSearch;

pub struct MaintenanceTask {
    search: Arc<FederatedSearch>,
    config: MaintenanceConfig,
}

impl MaintenanceTask {
    pub fn new(search: Arc<FederatedSearch>, config: MaintenanceConfig) -> Self {
        Self { search, config }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        tracing::info!(interval_secs = interval.as_secs(), "Maintenance task starting");

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Maintenance task received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One maintenance pass. Returns (cache entries, rate windows) removed.
    pub fn tick(&self) -> (usize, usize) {
        let limit = self.config.sweep_limit;
        let expired = self.search.resolution_cache().sweep(limit);
        let idle = self.search.rate_limiter().sweep(limit);
        self.search.breakers().publish_states();

        if expired > 0 || idle > 0 {
            tracing::debug!(expired, idle, "Maintenance sweep");
        }
        (expired, idle)
    }
}
