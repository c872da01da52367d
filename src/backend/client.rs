//! Backend search client.
//!
//! # Wire format
//! ```text
//! GET {base_url}/{type}?{params}&_count=N[&_page_token=T]
//!
//! { "entries": [ { "resource_type": "Patient", "id": "123",
//!                  "resource": { ... }, "mode": "match", "sort": [..]? } ],
//!   "next": "opaque" | null,
//!   "total": 42 | null }
//! ```
//! `sort` is optional; when absent the broker extracts sort values from the
//! resource itself.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::server::BackendServer;
use crate::config::AuthConfig;
use crate::query::params::{COUNT_PARAM, PAGE_TOKEN_PARAM};
use crate::query::{SortDirection, SortKey};

/// Whether an entry matched the query or was pulled in by an include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    #[default]
    Match,
    Include,
}

/// One entry as sent by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub resource: Value,
    #[serde(default)]
    pub mode: EntryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<Value>>,
}

/// One page as sent by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WirePage {
    #[serde(default)]
    pub entries: Vec<WireEntry>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Everything needed for one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub resource_type: Option<String>,
    pub params: Vec<(String, String)>,
    pub count: usize,
    pub page_token: Option<String>,
}

impl BackendRequest {
    /// Full parameter list including paging.
    pub fn wire_params(&self) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        params.push((COUNT_PARAM.to_string(), self.count.to_string()));
        if let Some(token) = &self.page_token {
            params.push((PAGE_TOKEN_PARAM.to_string(), token.clone()));
        }
        params
    }
}

/// Transport-level failure, before classification by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFailure {
    Unreachable(String),
    UnexpectedResponse(String),
}

/// The search API every federated server exposes.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(
        &self,
        server: &BackendServer,
        request: &BackendRequest,
    ) -> Result<WirePage, BackendFailure>;
}

/// HTTP implementation over `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpSearchBackend {
    client: Client,
}

impl HttpSearchBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(
        &self,
        server: &BackendServer,
        request: &BackendRequest,
    ) -> Result<WirePage, BackendFailure> {
        let url = server.search_url(request.resource_type.as_deref());
        let mut builder = self
            .client
            .get(url)
            .query(&request.wire_params())
            .header(reqwest::header::ACCEPT, "application/json");

        builder = match &server.auth {
            AuthConfig::None => builder,
            AuthConfig::Bearer { token } => builder.bearer_auth(token),
            AuthConfig::Basic { username, password } => builder.basic_auth(username, Some(password)),
            AuthConfig::Header { name, value } => builder.header(name.as_str(), value.as_str()),
        };
        for (name, value) in &server.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_request() {
                BackendFailure::Unreachable(e.to_string())
            } else {
                BackendFailure::UnexpectedResponse(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendFailure::UnexpectedResponse(format!("status {}", status)));
        }

        response
            .json::<WirePage>()
            .await
            .map_err(|e| BackendFailure::UnexpectedResponse(format!("invalid body: {}", e)))
    }
}

/// An entry ready for merging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchEntry {
    pub resource_type: String,
    pub id: String,
    pub resource: Value,
    #[serde(skip)]
    pub sort_values: Vec<Value>,
}

impl SearchEntry {
    pub fn from_wire(entry: WireEntry, sort: &[SortKey]) -> Self {
        let sort_values = match entry.sort {
            Some(values) if values.len() == sort.len() => values,
            _ => sort
                .iter()
                .map(|key| extract_sort_value(&entry.resource, key))
                .collect(),
        };
        Self {
            resource_type: entry.resource_type,
            id: entry.id,
            resource: entry.resource,
            sort_values,
        }
    }

    /// `Type/id`, the identity used for dedup and references.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

/// One backend's response to one sub-query.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSearchResult {
    pub server_id: String,
    pub entries: Vec<SearchEntry>,
    pub included: Vec<SearchEntry>,
    /// `None` means the server has nothing further.
    pub next_token: Option<String>,
    pub total: Option<u64>,
}

impl ServerSearchResult {
    pub fn is_exhausted(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Fields tried, in order, when a sort parameter resolves to an object.
const OBJECT_SORT_FIELDS: [&str; 6] = ["value", "reference", "family", "text", "start", "code"];

/// Best-effort sort value of `key` in a resource. Missing values are `Null`.
pub fn extract_sort_value(resource: &Value, key: &SortKey) -> Value {
    let field = match key.param.as_str() {
        "_id" => resource.get("id"),
        "_lastUpdated" => resource.get("meta").and_then(|m| m.get("lastUpdated")),
        param => resource.get(param).or_else(|| {
            resource.as_object().and_then(|object| {
                object
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(param))
                    .map(|(_, v)| v)
            })
        }),
    };
    field
        .map(|v| scalar(v, key.direction))
        .unwrap_or(Value::Null)
}

fn scalar(value: &Value, direction: SortDirection) -> Value {
    match value {
        Value::Array(items) => {
            // The backend orders multi-valued fields by the extreme value in
            // the requested direction.
            let mut values: Vec<Value> = items.iter().map(|v| scalar(v, direction)).collect();
            values.sort_by(crate::aggregation::merge::compare_values);
            match direction {
                SortDirection::Ascending => values.into_iter().next(),
                SortDirection::Descending => values.into_iter().last(),
            }
            .unwrap_or(Value::Null)
        }
        Value::Object(object) => OBJECT_SORT_FIELDS
            .iter()
            .find_map(|f| object.get(*f))
            .map(|v| scalar(v, direction))
            .unwrap_or(Value::Null),
        other => other.clone(),
    }
}
