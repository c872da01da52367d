//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! broker.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BrokerConfig (validated, immutable)
//!     → held in an ArcSwap by the federation service
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads + validates
//!     → atomic swap; in-flight searches keep the snapshot they started with
//! ```
//!
//! Circuit breakers and performance metrics are keyed by server id and
//! survive a reload.

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    AdminConfig, AggregationConfig, AuthConfig, BrokerConfig, CircuitBreakerConfig,
    LimitsConfig, ListenerConfig, MaintenanceConfig, ObservabilityConfig, OptimizerConfig,
    QueryConfig, ResolutionConfig, ResolutionMode, ServerConfig, StrategyConfig, TimeoutConfig,
};
