//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrated call to a backend:
//!     → circuit_breaker.rs (reject fast if open, record outcome)
//!     → timeouts.rs (per-server deadline + caller cancellation)
//!     → backend client
//! ```
//!
//! Breakers are per server, never global. Timeouts count as failures.

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitError, CircuitSnapshot, CircuitState,
};
pub use timeouts::{bounded, cancellable, until_deadline, Interrupted};
