//! Federated search pipeline.
//!
//! # Data Flow
//! ```text
//! SearchRequest (client id, resource type, raw params)
//!     → rate limit → parse + validate (query, continuation token)
//!     → admission (concurrency slot, memory reservation)
//!     → strategy (analyzer, or the one recorded in the token)
//!     → distributed chain rewrite (optional)
//!     → optimizer plan (first page) / token cursors (later pages)
//!     → aggregation engine
//!     → distributed includes (optional)
//!     → SearchResponse
//! ```

pub mod service;

pub use service::{DegradedServer, FederatedSearch, SearchRequest, SearchResponse};
