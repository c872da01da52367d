//! HTTP surface.
//!
//! # Data Flow
//! ```text
//! GET /{resource_type}?params   (or GET /?params for system-wide search)
//!     → server.rs (request id, trace, timeout; client id from x-client-id or peer IP)
//!     → FederatedSearch::search
//!     → JSON SearchResponse, or response.rs maps BrokerError to a status
//! ```

pub mod response;
pub mod server;

pub use server::{AppState, HttpServer};
