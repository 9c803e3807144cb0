//! Source Manager HTTP API - boundary operations over the event bus.
//!
//! Exposes five routes:
//! - `POST /api/sources` - create and connect a source
//! - `GET /api/sources` - stats for every source
//! - `DELETE /api/sources/:id` - stop and remove a source
//! - `POST /api/sources/:id/send` - send data through a source
//! - `POST /api/events/wait` - wait for the next matching event

use crate::manager::SourceManager;
use crate::registry::parse_config;
use crate::waiters::WaitOptions;
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sourcebus::{Event, SourceError, SourceStats};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default for `WaitRequest::timeout`, in milliseconds.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SourceManager>,
}

/// Request body for `POST /api/events/wait`.
#[derive(Debug, Default, Deserialize)]
pub struct WaitRequest {
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    /// Milliseconds; defaults to 30 seconds
    pub timeout: Option<u64>,
}

/// Response for `DELETE /api/sources/:id`.
#[derive(Serialize)]
pub struct DisconnectResponse {
    pub removed: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// Business logic (called from HTTP handlers and unit tests)
// ---------------------------------------------------------------------------

/// Creates a source from an untyped configuration and connects it.
///
/// Returns the source's stats once it is connected.
pub async fn handle_connect(state: &ApiState, config: Value) -> Result<SourceStats> {
    let config = parse_config(config)?;
    let source = state.manager.add(config).await?;
    info!(source_id = %source.id(), kind = %source.kind(), "Source connected via API");
    Ok(source.stats())
}

/// Waits for the next event matching the request.
pub async fn handle_wait(state: &ApiState, req: WaitRequest) -> Result<Event> {
    let timeout = Duration::from_millis(req.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
    let options = WaitOptions {
        source: req.source,
        event_type: req.event_type,
        timeout: Some(timeout),
        filter: None,
    };
    state.manager.wait_for_event(options).await
}

/// Stops and removes a source. Unknown ids are not an error.
pub async fn handle_disconnect(state: &ApiState, id: &str) -> bool {
    state.manager.remove(id).await
}

pub async fn handle_send(state: &ApiState, id: &str, data: Value) -> Result<()> {
    state.manager.send(id, data).await
}

pub async fn handle_status(state: &ApiState) -> Vec<SourceStats> {
    state.manager.stats().await
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn post_source(
    State(state): State<Arc<ApiState>>,
    Json(config): Json<Value>,
) -> Result<(StatusCode, Json<SourceStats>), AppError> {
    let stats = handle_connect(&state, config).await?;
    Ok((StatusCode::CREATED, Json(stats)))
}

async fn list_sources(State(state): State<Arc<ApiState>>) -> Json<Vec<SourceStats>> {
    Json(handle_status(&state).await)
}

async fn delete_source(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Json<DisconnectResponse> {
    let removed = handle_disconnect(&state, &id).await;
    Json(DisconnectResponse { removed })
}

async fn send_to_source(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(data): Json<Value>,
) -> Result<StatusCode, AppError> {
    handle_send(&state, &id, data).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn wait_for_event(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<WaitRequest>,
) -> Result<Json<Event>, AppError> {
    let event = handle_wait(&state, req).await?;
    Ok(Json(event))
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

struct AppError {
    status: StatusCode,
    message: String,
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        let status = match e.downcast_ref::<SourceError>() {
            Some(SourceError::DuplicateSource(_)) => StatusCode::CONFLICT,
            Some(SourceError::SourceNotFound(_)) => StatusCode::NOT_FOUND,
            Some(SourceError::WaitTimeout(_)) => StatusCode::REQUEST_TIMEOUT,
            Some(
                SourceError::UnknownKind(_)
                | SourceError::MissingOption { .. }
                | SourceError::InvalidOption { .. }
                | SourceError::SendUnsupported(_)
                | SourceError::NotConnected(_),
            ) => StatusCode::BAD_REQUEST,
            Some(SourceError::ConnectFailed { .. }) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %e, "Request failed");
        }
        AppError {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/sources", post(post_source).get(list_sources))
        .route("/api/sources/:id", delete(delete_source))
        .route("/api/sources/:id/send", post(send_to_source))
        .route("/api/events/wait", post(wait_for_event))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
