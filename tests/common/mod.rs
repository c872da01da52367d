//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use fanout_broker::config::{BrokerConfig, ServerConfig};
use fanout_broker::{HttpServer, Shutdown};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct MockData {
    /// Served entries, already in the backend's own order.
    entries: Vec<Value>,
    status: StatusCode,
    calls: AtomicUsize,
}

/// A running mock resource server.
pub struct MockBackend {
    pub addr: SocketAddr,
    data: Arc<MockData>,
}

impl MockBackend {
    pub fn calls(&self) -> usize {
        self.data.calls.load(Ordering::SeqCst)
    }

    pub fn server_config(&self, id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: String::new(),
            base_url: format!("http://{}/", self.addr),
            enabled: true,
            priority: 1,
            auth: Default::default(),
            timeout_secs: Some(5),
            headers: HashMap::new(),
            capabilities: HashMap::new(),
        }
    }
}

/// `{ "resource_type": "Patient", "id": id, "resource": { "name": name } }`
pub fn patient(id: &str, name: &str) -> Value {
    json!({
        "resource_type": "Patient",
        "id": id,
        "resource": { "id": id, "name": name },
        "mode": "match"
    })
}

/// Start a mock backend that pages `entries` by `_count`, using decimal
/// offsets as page tokens.
pub async fn start_backend(entries: Vec<Value>) -> MockBackend {
    start(entries, StatusCode::OK).await
}

/// Start a mock backend that answers every search with `status`.
pub async fn start_failing_backend(status: StatusCode) -> MockBackend {
    start(Vec::new(), status).await
}

async fn start(entries: Vec<Value>, status: StatusCode) -> MockBackend {
    let data = Arc::new(MockData {
        entries,
        status,
        calls: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/{resource_type}", get(search))
        .with_state(data.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockBackend { addr, data }
}

async fn search(
    State(data): State<Arc<MockData>>,
    Path(resource_type): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    data.calls.fetch_add(1, Ordering::SeqCst);
    if data.status != StatusCode::OK {
        return (data.status, "backend failure").into_response();
    }

    let matching: Vec<&Value> = data
        .entries
        .iter()
        .filter(|e| e["resource_type"] == resource_type.as_str())
        .collect();
    let count: usize = params.get("_count").and_then(|c| c.parse().ok()).unwrap_or(10);
    let offset: usize = params
        .get("_page_token")
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
        .min(matching.len());
    let end = (offset + count).min(matching.len());
    let next = (end < matching.len()).then(|| end.to_string());

    Json(json!({
        "entries": &matching[offset..end],
        "next": next,
        "total": matching.len(),
    }))
    .into_response()
}

/// A broker under test.
pub struct Broker {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
}

impl Broker {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn config(servers: Vec<ServerConfig>) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.servers = servers;
    config.observability.metrics_enabled = false;
    config
}

pub async fn start_broker(config: BrokerConfig) -> Broker {
    let shutdown = Shutdown::new();
    let (_, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    Broker { addr, shutdown }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

pub fn ids(body: &Value) -> Vec<String> {
    body["entries"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
