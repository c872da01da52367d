//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!     → HTTP server stops accepting, drains in-flight searches
//!     → maintenance task exits
//!
//! Maintenance (maintenance.rs):
//!     interval tick → bounded cache / rate-window sweep → circuit gauges
//! ```

pub mod maintenance;
pub mod shutdown;

pub use maintenance::MaintenanceTask;
pub use shutdown::{wait_for_signal, Shutdown};
