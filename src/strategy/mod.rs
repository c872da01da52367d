//! Strategy and planning subsystem.
//!
//! # Data Flow
//! ```text
//! AbstractQuery
//!     → analyzer.rs (Parallel | Sequential)
//!     → optimizer.rs (cost, server filtering, ranking, narrowing)
//!     → plan.rs (QueryExecutionPlan handed to the aggregation engine)
//! ```

pub mod analyzer;
pub mod optimizer;
pub mod plan;

pub use analyzer::{analyze, ExecutionStrategy};
pub use optimizer::{estimate_cost, QueryOptimizer};
pub use plan::{ExcludedServer, ExclusionReason, QueryExecutionPlan};
