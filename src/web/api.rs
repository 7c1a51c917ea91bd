//! Defines the Axum API routes and handlers.

use crate::command::{AckStatus, CommandId, CommandRequest};
use crate::config::Config;
use crate::hardware::StageBackend;
use crate::supervisor::{ResetError, SubmitError, SupervisorHandle};
use crate::telemetry::TelemetrySnapshot;
use crate::web::auth::{ResetAuthorizer, StaticTokenAuthorizer};
use crate::web::events::events;
use crate::web::models::{CommandListQuery, ResetResponse, StatusResponse, SubmitResponse, redacted_config};
use crate::web::rate_limiter::RateLimiter;
use crate::web::reset_rate_limit::reset_rate_limit_middleware;
use crate::web::stream::camera_stream;
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use axum_extra::typed_header::TypedHeaderRejection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Reset attempts allowed per IP and window.
const RESET_MAX_ATTEMPTS: u32 = 5;
const RESET_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_LIST_LIMIT: usize = 50;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

pub struct AppStateInner {
    pub supervisor: SupervisorHandle,
    /// Read-only access for the camera preview; commands go through `supervisor`.
    pub backend: Arc<dyn StageBackend>,
    pub telemetry: broadcast::Sender<TelemetrySnapshot>,
    pub config: Arc<Config>,
    pub reset_auth: Box<dyn ResetAuthorizer>,
    pub rate_limiter: RateLimiter,
}
pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(
        supervisor: SupervisorHandle,
        backend: Arc<dyn StageBackend>,
        telemetry: broadcast::Sender<TelemetrySnapshot>,
        config: Arc<Config>,
    ) -> Self {
        let reset_auth = Box::new(StaticTokenAuthorizer::new(config.web.reset_token.clone()));
        Self {
            supervisor,
            backend,
            telemetry,
            config,
            reset_auth,
            rate_limiter: RateLimiter::new(RESET_MAX_ATTEMPTS, RESET_WINDOW),
        }
    }
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/commands", post(submit_command).get(list_commands))
        .route("/api/v1/commands/{id}", get(get_command))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/config", get(get_config))
        .route(
            "/api/v1/emergency_stop/reset",
            post(reset_emergency_stop)
                .route_layer(axum::middleware::from_fn_with_state(state.clone(), reset_rate_limit_middleware)),
        )
        .route("/api/v1/events", get(events))
        .route("/api/v1/stream", get(camera_stream))
        .with_state(state)
}

/// POST /api/v1/commands
async fn submit_command(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Malformed command body: {}", rejection.body_text());
            return json_error(&rejection.body_text(), StatusCode::BAD_REQUEST);
        }
    };
    match state.supervisor.submit(request).await {
        Ok(id) => (StatusCode::ACCEPTED, Json(SubmitResponse { id, status: AckStatus::Pending })).into_response(),
        Err(SubmitError::Malformed(reason)) => json_error(&reason.to_string(), StatusCode::BAD_REQUEST),
        Err(e) => json_error(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// GET /api/v1/commands?limit=N, most recent first
async fn list_commands(State(state): State<AppState>, Query(query): Query<CommandListQuery>) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    (StatusCode::OK, Json(state.supervisor.recent(limit).await)).into_response()
}

/// GET /api/v1/commands/{id}
async fn get_command(State(state): State<AppState>, Path(id): Path<String>) -> axum::response::Response {
    let Ok(id) = id.parse::<CommandId>() else {
        return json_error("Invalid command id", StatusCode::BAD_REQUEST);
    };
    match state.supervisor.get_status(&id).await {
        Some(ack) => (StatusCode::OK, Json(ack)).into_response(),
        None => json_error("Command not found", StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/status
async fn get_status(State(state): State<AppState>) -> axum::response::Response {
    let queue = state.supervisor.queue_status().await;
    let readiness = state.supervisor.readiness();
    let response = StatusResponse {
        queue,
        zoom_position: readiness.zoom_position,
        telemetry_age_ms: readiness.last_telemetry_at.elapsed().as_millis(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// GET /api/v1/config
async fn get_config(State(state): State<AppState>) -> axum::response::Response {
    (StatusCode::OK, Json(redacted_config(&state.config))).into_response()
}

/// POST /api/v1/emergency_stop/reset -- requires the configured bearer token
async fn reset_emergency_stop(
    State(state): State<AppState>,
    auth: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
) -> axum::response::Response {
    if !state.reset_auth.enabled() {
        return json_error("Emergency stop reset is disabled; set web.reset_token", StatusCode::FORBIDDEN);
    }
    let Ok(TypedHeader(auth)) = auth else {
        return json_error("Missing bearer token", StatusCode::UNAUTHORIZED);
    };
    if !state.reset_auth.authorize(auth.token()).await {
        tracing::warn!("Emergency stop reset with invalid token");
        return json_error("Invalid token", StatusCode::UNAUTHORIZED);
    }
    match state.supervisor.reset_emergency_stop().await {
        Ok(()) => {
            let readiness = state.supervisor.readiness();
            let body = ResetResponse { result: "ok", status: state.supervisor.system_status(), homed: readiness.homed };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e @ (ResetError::NotStopped(_) | ResetError::Busy)) => json_error(&e.to_string(), StatusCode::CONFLICT),
        Err(e @ ResetError::Hardware(_)) => json_error(&e.to_string(), StatusCode::BAD_GATEWAY),
        Err(e @ ResetError::Unavailable) => json_error(&e.to_string(), StatusCode::SERVICE_UNAVAILABLE),
    }
}

