//! Distributed aggregation subsystem.
//!
//! # Data Flow
//! ```text
//! QueryExecutionPlan (+ decoded ContinuationToken when resuming)
//!     → engine.rs (parallel fan-out or sequential drain)
//!     → merge.rs (k-way merge, deterministic tie-break)
//!     → token.rs (per-server cursors → opaque continuation)
//! ```
//!
//! The continuation token is the only state carried between requests.

pub mod engine;
pub mod merge;
pub mod token;

pub use engine::{AggregatedPage, AggregationEngine, ExecutionContext};
pub use merge::{compare_values, KWayMerger, MergeSource, MergeStep};
pub use token::{ContinuationToken, DedupBoundary, ServerCursor};
