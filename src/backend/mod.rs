//! Backend server subsystem.
//!
//! # Data Flow
//! ```text
//! [[servers]] config
//!     → server.rs (BackendServer: identity, auth, capabilities)
//!
//! Sub-query for one server:
//!     → orchestrator.rs (breaker, timeout, cancellation, metrics)
//!     → client.rs (SearchBackend trait, reqwest implementation)
//!     → ServerSearchResult
//! ```

pub mod client;
pub mod orchestrator;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    BackendFailure, BackendRequest, EntryMode, HttpSearchBackend, SearchBackend, SearchEntry,
    ServerSearchResult, WireEntry, WirePage,
};
pub use orchestrator::{CallLimits, ServerOrchestrator};
pub use server::{servers_from_config, BackendServer};
