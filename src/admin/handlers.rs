use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::health::PerformanceMetrics;
use crate::http::AppState;
use crate::resilience::CircuitSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub servers: usize,
    pub active_searches: usize,
    pub cached_resolutions: usize,
    pub rate_limited_clients: usize,
}

#[derive(Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub enabled: bool,
    pub priority: u32,
    pub circuit: CircuitSnapshot,
    /// Absent until the server has been called.
    pub performance: Option<PerformanceMetrics>,
}

#[derive(Serialize)]
pub struct CircuitChange {
    pub server: String,
    pub circuit: CircuitSnapshot,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let search = &state.search;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        servers: search.servers().len(),
        active_searches: search.active_searches(),
        cached_resolutions: search.resolution_cache().len(),
        rate_limited_clients: search.rate_limiter().tracked_clients(),
    })
}

pub async fn get_servers(State(state): State<AppState>) -> Json<Vec<ServerStatus>> {
    let search = &state.search;
    let statuses = search
        .servers()
        .iter()
        .map(|server| ServerStatus {
            id: server.id.clone(),
            name: server.name.clone(),
            base_url: server.base_url.to_string(),
            enabled: server.enabled,
            priority: server.priority,
            circuit: search.breakers().snapshot(&server.id),
            performance: search.performance().get(&server.id),
        })
        .collect();
    Json(statuses)
}

pub async fn trip_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CircuitChange>, StatusCode> {
    change_circuit(&state, id, true)
}

pub async fn reset_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CircuitChange>, StatusCode> {
    change_circuit(&state, id, false)
}

fn change_circuit(state: &AppState, id: String, open: bool) -> Result<Json<CircuitChange>, StatusCode> {
    let search = &state.search;
    if !search.servers().iter().any(|s| s.id == id) {
        return Err(StatusCode::NOT_FOUND);
    }

    let breakers = search.breakers();
    if open {
        breakers.trip(&id);
    } else {
        breakers.reset(&id);
    }
    tracing::info!(server = %id, open, "Circuit changed by admin");
    Ok(Json(CircuitChange {
        circuit: breakers.snapshot(&id),
        server: id,
    }))
}
