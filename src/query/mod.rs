//! Abstract query model.
//!
//! # Data Flow
//! ```text
//! inbound (key, value) params
//!     → params.rs (parse into AbstractQuery + continuation)
//!     → model.rs (closed clause types, read-only to the broker)
//!     → resolution may produce a rewritten copy with IdSet filters
//!     → params.rs (serialize back to key/value for each backend call)
//! ```

pub mod model;
pub mod params;

pub use model::{
    AbstractQuery, Chain, ChainLink, Filter, ForwardChain, Include, Operator, ReverseChain,
    SortDirection, SortKey,
};
pub use params::{parse_params, to_wire_params, ParsedRequest};
