//! Distributed continuation token.
//!
//! # Wire format
//! URL-safe base64 (no padding) of snake_case JSON:
//! ```text
//! { "servers": [ { "endpoint", "token", "exhausted", "last_sort_value",
//!                  "results_returned", "page_token", "page_offset" } ],
//!   "sort_criteria", "page_size", "execution_strategy", "resource_type",
//!   "server_page_size", "dedup_boundary"? }
//! ```
//! `page_token` + `page_offset` locate the next unconsumed entry: the page a
//! server was serving when the merge stopped (None = its first page) and how
//! many of its entries were already consumed. `token` is the server's own
//! next-page token.
//!
//! `dedup_boundary` is only present on deduplicated sorted scans. It holds the
//! entries emitted with the last sort value, the only ones a later page can
//! repeat.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueryError;
use crate::query::{AbstractQuery, SortKey};
use crate::strategy::ExecutionStrategy;

/// Resume state of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCursor {
    /// Server id.
    pub endpoint: String,
    pub token: Option<String>,
    pub exhausted: bool,
    pub last_sort_value: Option<Vec<Value>>,
    pub results_returned: u64,
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default)]
    pub page_offset: usize,
}

impl ServerCursor {
    pub fn fresh(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            exhausted: false,
            last_sort_value: None,
            results_returned: 0,
            page_token: None,
            page_offset: 0,
        }
    }
}

/// References emitted with the final sort value of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupBoundary {
    pub sort_values: Vec<Value>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationToken {
    pub servers: Vec<ServerCursor>,
    pub sort_criteria: Vec<SortKey>,
    pub page_size: usize,
    pub execution_strategy: ExecutionStrategy,
    pub resource_type: Option<String>,
    /// Count requested from each server; fixed for the whole scan so page
    /// offsets stay valid.
    #[serde(default)]
    pub server_page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_boundary: Option<DedupBoundary>,
}

impl ContinuationToken {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self, QueryError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|e| QueryError::InvalidToken(format!("not base64: {}", e)))?;
        let token: Self = serde_json::from_slice(&bytes)
            .map_err(|e| QueryError::InvalidToken(format!("malformed: {}", e)))?;

        if token.page_size == 0 {
            return Err(QueryError::InvalidToken("page_size must be positive".into()));
        }
        if token.servers.is_empty() {
            return Err(QueryError::InvalidToken("no servers recorded".into()));
        }
        Ok(token)
    }

    /// Reject tokens minted for a different logical query.
    pub fn validate(&self, query: &AbstractQuery) -> Result<(), QueryError> {
        if self.resource_type != query.resource_type {
            return Err(QueryError::TokenMismatch(format!(
                "resource type {} != {}",
                self.resource_type.as_deref().unwrap_or("*"),
                query.resource_type.as_deref().unwrap_or("*"),
            )));
        }
        if self.sort_criteria != query.sort {
            return Err(QueryError::TokenMismatch("sort criteria differ".into()));
        }
        if self.page_size != query.page_size {
            return Err(QueryError::TokenMismatch(format!(
                "page size {} != {}",
                self.page_size, query.page_size
            )));
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.servers.iter().all(|s| s.exhausted)
    }

    pub fn cursor(&self, server_id: &str) -> Option<&ServerCursor> {
        self.servers.iter().find(|s| s.endpoint == server_id)
    }
}
