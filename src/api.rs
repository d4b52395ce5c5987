//! Local HTTP surface of the worker: the control plane for page agents and
//! the popup, page and download events from the host, health and metrics.

use crate::capture::agent::{AgentRegistry, PageEvent, PageOutcome};
use crate::capture::observer::{DownloadEvent, DownloadObserver, ObserveOutcome};
use crate::control::{ControlError, ControlHandle, Reply, StatusView};
use crate::security::{ControlAuth, require_control_auth};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub control: ControlHandle,
    pub observer: Arc<DownloadObserver>,
    pub pages: Arc<AgentRegistry>,
    pub prometheus: Option<PrometheusHandle>,
    pub metrics_key: Option<String>,
}

pub fn router(state: AppState, auth: ControlAuth) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/status", get(status))
        .route("/control", post(control))
        .route("/downloads", post(downloads))
        .route("/pages", post(pages))
        .route_layer(middleware::from_fn_with_state(auth, require_control_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

/// CSV reports travel base64-encoded inside JSON, so the limit is generous.
fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(16 * 1024 * 1024)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "ebay-ingest",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .prometheus
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusView>, AppError> {
    crate::metrics::inc_requests("/status");
    Ok(Json(state.control.status().await?))
}

/// Any control-plane message. The reply envelope carries success or
/// failure, so the HTTP status is 200 unless the worker is gone.
async fn control(State(state): State<AppState>, Json(message): Json<Value>) -> Response {
    crate::metrics::inc_requests("/control");
    let reply: Reply = state.control.dispatch(message).await;
    let status = match reply.error.as_deref() {
        Some("unavailable") => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(reply)).into_response()
}

async fn downloads(
    State(state): State<AppState>,
    Json(event): Json<DownloadEvent>,
) -> Json<ObserveOutcome> {
    crate::metrics::inc_requests("/downloads");
    Json(state.observer.handle(event).await)
}

async fn pages(State(state): State<AppState>, Json(event): Json<PageEvent>) -> Json<PageOutcome> {
    crate::metrics::inc_requests("/pages");
    Json(state.pages.handle(event).await)
}

enum AppError {
    Control(ControlError),
}

impl From<ControlError> for AppError {
    fn from(value: ControlError) -> Self {
        Self::Control(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Control(err) => {
                let (status, code) = match &err {
                    ControlError::CoordinatorGone => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                    ControlError::Rejected { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "rejected"),
                    ControlError::Decode(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                warn!(target = "ingest.api", error = %err, "request_failed");
                let payload = ApiError {
                    error: code.to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}
