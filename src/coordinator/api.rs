//! REST API handlers for the Coordinator server
//!
//! Every lock operation is exposed as JSON over HTTP. Outcomes map to status
//! codes: granted 200, queued 202, and every lock error is a 4xx so callers can
//! tell "busy" apart from a coordinator failure.

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use super::error::LockError;
use super::health::{component_checks, ComponentHealth, HealthStatus};
use super::server::AppState;
use super::service::CoordinatorStats;
use super::types::{Acquisition, HeartbeatAck, HolderId, HolderState, LockMode, StatusSnapshot};
use crate::metrics;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code, e.g. `not_holder`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            code: Some(code.into()),
        }
    }
}

impl IntoResponse for LockError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ApiResponse::failure(self.to_string(), self.code())),
        )
            .into_response()
    }
}

/// Acquire request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequest {
    pub holder_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ms: Option<u64>,
    /// `false` refuses with 423 instead of queueing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
}

/// Release, heartbeat and cancel request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderRequest {
    pub holder_id: String,
}

/// Acquire outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResponse {
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<LockMode>,
}

impl From<Acquisition> for AcquireResponse {
    fn from(outcome: Acquisition) -> Self {
        match outcome {
            Acquisition::Granted => Self {
                granted: true,
                queue_position: None,
                blocked_by: None,
            },
            Acquisition::Pending {
                queue_position,
                blocked_by,
            } => Self {
                granted: false,
                queue_position: Some(queue_position),
                blocked_by: Some(blocked_by),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub released: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub checks: Vec<ComponentHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub holder_id: Option<String>,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        // Lock endpoints
        .route("/api/locks", get(get_stats))
        .route("/api/locks/{resource_id}", get(get_status))
        .route("/api/locks/{resource_id}/holders/{holder_id}", get(get_holder_state))
        .route("/api/locks/{resource_id}/read", post(acquire_read))
        .route("/api/locks/{resource_id}/read/release", post(release_read))
        .route("/api/locks/{resource_id}/write", post(acquire_write))
        .route("/api/locks/{resource_id}/write/release", post(release_write))
        .route("/api/locks/{resource_id}/heartbeat", post(heartbeat))
        .route("/api/locks/{resource_id}/cancel", post(cancel))
        .route("/api/locks/{resource_id}/events", get(lock_events))
        // Holder endpoints
        .route("/api/holders/{holder_id}/disconnect", post(disconnect))
        .route_layer(middleware::from_fn(track_request_metrics))
        .with_state(state)
}

/// Record count and latency per matched route
async fn track_request_metrics(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (status, checks) = component_checks(&state);

    (
        status.status_code(),
        Json(ApiResponse::success(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            checks,
        })),
    )
}

/// Prometheus text exposition
async fn prometheus_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::failure(e.to_string(), "metrics_unavailable")),
        )
            .into_response(),
    }
}

// ============================================================================
// Lock Handlers
// ============================================================================

async fn get_stats(State(state): State<AppState>) -> Json<ApiResponse<CoordinatorStats>> {
    Json(ApiResponse::success(state.coordinator.stats()))
}

async fn get_status(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
) -> Result<Json<ApiResponse<StatusSnapshot>>, LockError> {
    let status = state.coordinator.status(&resource_id)?;
    Ok(Json(ApiResponse::success(status)))
}

async fn get_holder_state(
    State(state): State<AppState>,
    Path((resource_id, holder_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<HolderState>>, LockError> {
    let holder_state = state.coordinator.holder_state(&resource_id, &holder_id)?;
    Ok(Json(ApiResponse::success(holder_state)))
}

fn acquisition_response(outcome: Acquisition) -> Response {
    let status = if outcome.is_granted() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(ApiResponse::success(AcquireResponse::from(outcome)))).into_response()
}

async fn acquire_read(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(request): Json<AcquireRequest>,
) -> Result<Response, LockError> {
    let c = &state.coordinator;
    if request.wait == Some(false) {
        c.try_acquire_read(&resource_id, &request.holder_id, request.lease_ms)?;
        return Ok(acquisition_response(Acquisition::Granted));
    }
    let outcome = c.acquire_read(&resource_id, &request.holder_id, request.lease_ms)?;
    Ok(acquisition_response(outcome))
}

async fn acquire_write(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(request): Json<AcquireRequest>,
) -> Result<Response, LockError> {
    let c = &state.coordinator;
    if request.wait == Some(false) {
        c.try_acquire_write(&resource_id, &request.holder_id, request.lease_ms)?;
        return Ok(acquisition_response(Acquisition::Granted));
    }
    let outcome = c.acquire_write(&resource_id, &request.holder_id, request.lease_ms)?;
    Ok(acquisition_response(outcome))
}

async fn release_read(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<ApiResponse<OkResponse>>, LockError> {
    state.coordinator.release_read(&resource_id, &request.holder_id)?;
    Ok(Json(ApiResponse::success(OkResponse { ok: true })))
}

async fn release_write(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<ApiResponse<OkResponse>>, LockError> {
    state.coordinator.release_write(&resource_id, &request.holder_id)?;
    Ok(Json(ApiResponse::success(OkResponse { ok: true })))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<ApiResponse<HeartbeatAck>>, LockError> {
    let ack = state.coordinator.heartbeat(&resource_id, &request.holder_id)?;
    Ok(Json(ApiResponse::success(ack)))
}

async fn cancel(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Json(request): Json<HolderRequest>,
) -> Result<Json<ApiResponse<CancelResponse>>, LockError> {
    let cancelled = state.coordinator.cancel(&resource_id, &request.holder_id)?;
    Ok(Json(ApiResponse::success(CancelResponse { cancelled })))
}

async fn disconnect(
    State(state): State<AppState>,
    Path(holder_id): Path<String>,
) -> Result<Json<ApiResponse<DisconnectResponse>>, LockError> {
    let released = state.coordinator.disconnect(&holder_id)?;
    Ok(Json(ApiResponse::success(DisconnectResponse { released })))
}

// ============================================================================
// Event Stream
// ============================================================================

/// Server-sent lock events for one resource
///
/// With `holderId`, each `lockAcquired` carries `grantedToYou`, so a queued
/// caller learns of its own grant without polling.
async fn lock_events(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, LockError> {
    let subscription = state.coordinator.subscribe_to(&resource_id)?;
    let viewer = query.holder_id.map(HolderId::parse).transpose()?;
    let shutdown = state.shutdown.subscribe();

    tracing::debug!(resource = %resource_id, "Event stream opened");

    let events = stream::unfold(
        (subscription, viewer, shutdown),
        |(mut subscription, viewer, mut shutdown)| async move {
            tokio::select! {
                event = subscription.recv() => {
                    let event = event?;
                    let notification = event.to_notification(viewer.as_ref());
                    let sse = Event::default()
                        .event(event.name())
                        .json_data(&notification)
                        .unwrap_or_else(|e| {
                            tracing::warn!(error = %e, "Failed to encode lock event");
                            Event::default().comment("encoding error")
                        });
                    Some((Ok(sse), (subscription, viewer, shutdown)))
                }
                _ = shutdown.changed() => None,
            }
        },
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Tests
// ============================================================================
