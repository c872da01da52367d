//! Server health subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrated call completes (success or failure)
//!     → performance.rs (latency EMA, success rate, rating)
//!     → optimizer reads ratings to order and narrow servers
//! ```
//!
//! Health here is passive only: it is derived from real search traffic,
//! never from probes.

pub mod performance;

pub use performance::{HealthThresholds, PerformanceMetrics, PerformanceRegistry};
