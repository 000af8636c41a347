use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use kd_core::types::{Environment, EnvironmentSpec};
use kd_provision::lifecycle::LifecycleManager;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::terminal_bridge::TerminalBridge;
use crate::terminal_ws;

/// Shared application state for all HTTP/WS handlers.
pub struct ApiState {
    pub lifecycle: Arc<LifecycleManager>,
    pub bridge: Arc<TerminalBridge>,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(lifecycle: Arc<LifecycleManager>, bridge: Arc<TerminalBridge>) -> Self {
        Self {
            lifecycle,
            bridge,
            start_time: Instant::now(),
        }
    }
}

/// Build the API router with all REST and WebSocket routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/environments",
            get(list_environments).post(create_environment),
        )
        .route(
            "/api/environments/{id}",
            get(get_environment).delete(delete_environment),
        )
        .route("/ws/terminal", get(terminal_ws::terminal_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub environments: usize,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid environment id: {raw}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        environments: state.lifecycle.store().len(),
        sessions: state.lifecycle.sessions().len(),
    })
}

/// GET /api/environments
async fn list_environments(State(state): State<Arc<ApiState>>) -> Json<Vec<Environment>> {
    Json(state.lifecycle.list_environments())
}

/// POST /api/environments: returns immediately with the `creating` record.
async fn create_environment(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<EnvironmentSpec>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(spec) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let env = state.lifecycle.create_environment(&spec)?;
    Ok((StatusCode::CREATED, Json(env)))
}

/// GET /api/environments/{id}
async fn get_environment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Environment>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.lifecycle.get_environment(&id)?))
}

/// DELETE /api/environments/{id}: waits for the cluster teardown.
async fn delete_environment(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let env = state.lifecycle.delete_environment(&id).await?;
    info!(%id, name = %env.name, "environment deleted via API");
    Ok(Json(MessageResponse {
        message: format!("environment {} deleted", env.name),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            parse_id("not-a-uuid"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
