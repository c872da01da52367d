//! Admin API.
//!
//! Every route requires `Authorization: Bearer <admin.api_key>`.
//!
//! - `GET  /admin/status`               broker summary
//! - `GET  /admin/servers`              per-server circuit and performance
//! - `POST /admin/servers/{id}/trip`    force a circuit open
//! - `POST /admin/servers/{id}/reset`   force a circuit closed

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/servers", get(get_servers))
        .route("/admin/servers/{id}/trip", post(trip_server))
        .route("/admin/servers/{id}/reset", post(reset_server))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
