//! Tool-server management endpoints.
//!
//! Response shapes here are a frozen contract with the operator UI and
//! CLI; the serialization tests below pin them.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tb_domain::config::{is_valid_server_name, ToolServerConfig};
use tb_domain::event::HealthStatus;
use tb_domain::Error;
use tb_servers::health::HealthSummary;

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/servers/health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub summary: HealthSummary,
    pub servers: Vec<ServerHealthEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthEntry {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let servers = state
        .health
        .snapshot()
        .into_iter()
        .map(|(name, health)| ServerHealthEntry {
            name,
            status: health.status,
            last_check: health.last_check,
            last_success: health.last_success,
            consecutive_failures: health.consecutive_failures,
            error: health.last_error,
        })
        .collect();
    Json(HealthResponse {
        summary: state.health.summary(),
        servers,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/servers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct AddServerRequest {
    pub name: String,
    pub config: ToolServerConfig,
}

pub async fn add(
    State(state): State<AppState>,
    Json(request): Json<AddServerRequest>,
) -> Response {
    match state.registry.add(&request.name, request.config) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "name": request.name })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /api/servers/{name}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn remove(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if !is_valid_server_name(&name) {
        return error_response(Error::Validation(format!("invalid server name {name:?}")));
    }
    match state.registry.remove(&name) {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "name": name }))).into_response(),
        Err(err) => error_response(err),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/servers/{name}/reconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn reconnect(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.registry.get(&name).is_none() {
        return error_response(Error::NotFound(format!("no such server: {name}")));
    }
    state.health.force_reconnect(&name);
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "name": name })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Backpressure(_) | Error::Contention(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
