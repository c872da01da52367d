//! Admission control.
//!
//! # Data Flow
//! ```text
//! Incoming search:
//!     → rate_limit.rs (per-client sliding window)
//!     → validation (query, token)
//!     → limits.rs (concurrency slot + memory reservation)
//!     → search executes holding the SearchPermit
//! ```
//!
//! Every check fails closed with a retryable error carrying a retry-after.

pub mod limits;
pub mod rate_limit;

pub use limits::{estimate_memory, AdmissionController, SearchPermit};
pub use rate_limit::RateLimiter;
