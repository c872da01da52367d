//! Federated search broker.
//!
//! One client search is fanned out to a set of independently operated
//! resource servers; their results are merged into a single globally
//! ordered page with a continuation token that resumes the distributed scan.

// Core pipeline
pub mod aggregation;
pub mod backend;
pub mod federation;
pub mod query;
pub mod resolution;
pub mod strategy;

// Surfaces
pub mod admin;
pub mod http;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use federation::{FederatedSearch, SearchRequest, SearchResponse};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
