//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum router (search, health, admin)
//! - Wire up middleware (request id, tracing, request timeout)
//! - Translate requests into `SearchRequest`s
//! - Apply configuration updates and run background maintenance

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Path, RawQuery, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin;
use crate::backend::{HttpSearchBackend, SearchBackend};
use crate::config::BrokerConfig;
use crate::federation::{FederatedSearch, SearchRequest};
use crate::lifecycle::MaintenanceTask;

/// Header naming the caller for rate limiting. Falls back to the peer IP.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub search: Arc<FederatedSearch>,
}

/// HTTP front end of the broker.
pub struct HttpServer {
    router: Router,
    state: AppState,
    config: BrokerConfig,
}

impl HttpServer {
    /// Create a server that reaches backends over HTTP.
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_backend(config, Arc::new(HttpSearchBackend::default()))
    }

    pub fn with_backend(config: BrokerConfig, backend: Arc<dyn SearchBackend>) -> Self {
        let state = AppState {
            search: Arc::new(FederatedSearch::new(config.clone(), backend)),
        };
        let router = Self::build_router(&config, state.clone());
        Self {
            router,
            state,
            config,
        }
    }

    #[allow(deprecated)]
    fn build_router(config: &BrokerConfig, state: AppState) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/", get(system_search_handler))
            .route("/{resource_type}", get(search_handler))
            .with_state(state.clone());

        if config.admin.enabled {
            router = router.merge(admin::router(state));
        }

        router.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TimeoutLayer::new(Duration::from_secs(
                    config.listener.request_timeout_secs,
                ))),
        )
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` fires. Configurations received on
    /// `config_updates` are applied to the running broker.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<BrokerConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            servers = self.config.servers.len(),
            "HTTP server starting"
        );

        let maintenance = MaintenanceTask::new(self.state.search.clone(), self.config.maintenance.clone());
        tokio::spawn(maintenance.run(shutdown.resubscribe()));

        let search = self.state.search.clone();
        tokio::spawn(async move {
            while let Some(config) = config_updates.recv().await {
                search.reload(config);
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let servers = state.search.servers();
    Json(json!({
        "status": "ok",
        "servers": servers.len(),
        "enabled_servers": servers.iter().filter(|s| s.enabled).count(),
        "active_searches": state.search.active_searches(),
    }))
}

async fn search_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    run_search(&state, addr, &headers, Some(resource_type), query).await
}

async fn system_search_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    run_search(&state, addr, &headers, None, query).await
}

async fn run_search(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    resource_type: Option<String>,
    query: Option<String>,
) -> Response {
    let client = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| addr.ip().to_string());
    let params = query
        .as_deref()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    // Cancels the search when the client goes away or the request times out.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let request = SearchRequest {
        client,
        resource_type,
        params,
    };
    match state.search.search(request, cancel).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}
