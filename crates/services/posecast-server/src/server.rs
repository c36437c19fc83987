//! HTTP signaling and preview server
//!
//! Endpoints:
//! - POST /camera_offer - Negotiate a camera peer
//! - POST /monitor_offer - Negotiate a monitor peer
//! - GET /view?cam=<slot> - MJPEG preview of one camera slot
//! - GET /status - Slots, sessions, sinks and pose counters
//! - DELETE /sessions/:session_id - Close one session
//! - GET /health - Health check

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use posecast_core::preview::CONTENT_TYPE;
use posecast_core::{Error, NegotiatedSession, ServerStatus, SessionDescription, SessionManager};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio_stream::StreamExt as _;

/// Server state shared across handlers
#[derive(Clone)]
struct ServerState {
    manager: Arc<SessionManager>,
}

/// HTTP front end of a [`SessionManager`]
pub struct PosecastServer {
    /// Server bind address
    bind_address: String,
    /// Shared server state
    state: ServerState,
}

impl PosecastServer {
    pub fn new(bind_address: impl Into<String>, manager: Arc<SessionManager>) -> Self {
        Self {
            bind_address: bind_address.into(),
            state: ServerState { manager },
        }
    }

    /// Build the router with all endpoints
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .route("/camera_offer", post(camera_offer_handler))
            .route("/monitor_offer", post(monitor_offer_handler))
            .route("/view", get(view_handler))
            .route("/sessions/:session_id", delete(close_session_handler))
            .with_state(self.state.clone())
            .layer(
                tower::ServiceBuilder::new()
                    .layer(tower_http::trace::TraceLayer::new_for_http())
                    .layer(tower_http::cors::CorsLayer::permissive()),
            )
    }

    /// Serve until `signal` resolves, then shut the engine down
    ///
    /// The engine is shut down before the listener drains, which ends every
    /// open preview stream so the drain can finish.
    pub async fn serve<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: std::net::SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", self.bind_address, e))?;

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

        tracing::info!("Posecast server listening on {}", addr);

        let manager = Arc::clone(&self.state.manager);
        let drain = async move {
            signal.await;
            tracing::info!("Shutdown signal received, stopping sessions");
            if let Err(e) = manager.shutdown().await {
                tracing::error!("Session manager shutdown failed: {}", e);
            }
        };

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(drain)
            .await;

        // Covers the listener failing before any signal arrived
        self.state.manager.shutdown().await?;
        served.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        tracing::info!("Posecast server stopped");
        Ok(())
    }
}

// Handler implementations

/// Health check endpoint
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Error response body for structured error responses
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    /// Error type (e.g., "negotiation", "not_found", "shutting_down", "internal")
    error_type: String,
    /// Human-readable error message
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map engine errors to HTTP status codes and structured responses
fn map_error(e: Error) -> ApiError {
    let (status, error_type) = match &e {
        Error::Negotiation(_) => (StatusCode::BAD_REQUEST, "negotiation"),
        Error::SessionNotFound(_) | Error::SlotNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
        Error::InvalidConfig(_) => (StatusCode::BAD_REQUEST, "config"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            error_type: error_type.to_string(),
            message: e.to_string(),
        }),
    )
}

/// GET /status - Engine status snapshot
async fn status_handler(State(state): State<ServerState>) -> Json<ServerStatus> {
    Json(state.manager.status())
}

/// POST /camera_offer - Negotiate a camera peer
async fn camera_offer_handler(
    State(state): State<ServerState>,
    Json(offer): Json<SessionDescription>,
) -> std::result::Result<Json<NegotiatedSession>, ApiError> {
    let negotiated = state.manager.negotiate_camera(offer).await.map_err(|e| {
        tracing::warn!("Camera negotiation failed: {}", e);
        map_error(e)
    })?;
    Ok(Json(negotiated))
}

/// POST /monitor_offer - Negotiate a monitor peer
async fn monitor_offer_handler(
    State(state): State<ServerState>,
    Json(offer): Json<SessionDescription>,
) -> std::result::Result<Json<NegotiatedSession>, ApiError> {
    let negotiated = state.manager.negotiate_monitor(offer).await.map_err(|e| {
        tracing::warn!("Monitor negotiation failed: {}", e);
        map_error(e)
    })?;
    Ok(Json(negotiated))
}

/// Query for GET /view
#[derive(Debug, Deserialize)]
struct ViewQuery {
    #[serde(default = "default_cam")]
    cam: String,
}

fn default_cam() -> String {
    "cam1".to_string()
}

/// GET /view - Multipart JPEG stream of one slot
async fn view_handler(
    State(state): State<ServerState>,
    Query(query): Query<ViewQuery>,
) -> std::result::Result<Response, ApiError> {
    let stream = state.manager.preview_stream(&query.cam).map_err(map_error)?;
    let body = Body::from_stream(stream.map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// DELETE /sessions/:session_id - Close one session
async fn close_session_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state
        .manager
        .close_session(&session_id)
        .await
        .map_err(map_error)?;

    tracing::info!("Closed session {} on request", session_id);
    Ok(StatusCode::NO_CONTENT)
}
