//! Control API.
//!
//! The conversational surface (client sockets) is owned by the external
//! transport server; this router only exposes the operator endpoints for
//! tool-server management and health.

pub mod servers;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/servers/health", get(servers::health))
        .route("/api/servers", post(servers::add))
        .route("/api/servers/:name", delete(servers::remove))
        .route("/api/servers/:name/reconnect", post(servers::reconnect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
