//! REST API Handlers
//!
//! JSON rendition of the Identity, Controller and Node services, plus
//! health and Prometheus endpoints. Each request gets its own
//! [`RequestContext`]; dropping the connection drops the handler future and
//! with it any wait for admission.

use crate::admission::RequestContext;
use crate::controlplane::service::{PluginService, UNIMPLEMENTED_RPCS};
use crate::domain::types::*;
use crate::error::{Code, Diagnostics, Error};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Status code name, e.g. `out_of_range`
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityResponse {
    pub available_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub publish_context: BTreeMap<String, String>,
}

/// Success that may carry best-effort failures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl From<Diagnostics> for OperationResponse {
    fn from(diagnostics: Diagnostics) -> Self {
        Self {
            warnings: diagnostics.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// HTTP status for a protocol status code
pub fn status_for(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::UNPROCESSABLE_ENTITY,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT),
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let code = e.code();
    (
        status_for(code),
        Json(ApiErrorResponse {
            error: code.to_string(),
            message: e.to_string(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    service: Arc<PluginService>,
    request_timeout: Option<Duration>,
}

impl RestRouter {
    pub fn new(service: Arc<PluginService>) -> Self {
        Self {
            service,
            request_timeout: None,
        }
    }

    /// Deadline applied to every request
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            service: self.service,
            request_timeout: self.request_timeout,
        };

        Router::new()
            // Identity
            .route("/v1/identity/info", get(get_plugin_info))
            .route("/v1/identity/capabilities", get(get_plugin_capabilities))
            .route("/v1/identity/probe", get(probe))
            // Controller
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:id", delete(delete_volume))
            .route("/v1/capabilities/validate", post(validate_volume_capabilities))
            .route("/v1/capacity", post(get_capacity))
            .route("/v1/controller/publish", post(controller_publish))
            .route("/v1/controller/unpublish", post(controller_unpublish))
            .route("/v1/controller/capabilities", get(controller_capabilities))
            // Node
            .route("/v1/node/publish", post(node_publish))
            .route("/v1/node/unpublish", post(node_unpublish))
            .route("/v1/node/capabilities", get(node_capabilities))
            .route("/v1/node/info", get(node_info))
            // Everything else the protocol names
            .route("/v1/rpc/:name", post(unsupported_rpc))
            // Health and metrics
            .route("/healthz", get(health_check))
            .route("/metrics", get(metrics))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<PluginService>,
    request_timeout: Option<Duration>,
}

impl AppState {
    fn context(&self) -> RequestContext {
        match self.request_timeout {
            Some(timeout) => RequestContext::with_timeout(timeout),
            None => RequestContext::new(),
        }
    }
}

// =============================================================================
// Identity Handlers
// =============================================================================

async fn get_plugin_info(State(state): State<AppState>) -> Response {
    respond(state.service.get_plugin_info(&state.context()).await)
}

async fn get_plugin_capabilities(State(state): State<AppState>) -> Response {
    respond(state.service.get_plugin_capabilities(&state.context()).await)
}

async fn probe(State(state): State<AppState>) -> Response {
    match state.service.probe(&state.context()).await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Controller Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!("Creating volume: {}", request.name);
    match state.service.create_volume(&state.context(), &request).await {
        Ok(volume) => (StatusCode::CREATED, Json(volume)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.delete_volume(&state.context(), &id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_volumes(
    State(state): State<AppState>,
    Query(request): Query<ListVolumesRequest>,
) -> Response {
    respond(state.service.list_volumes(&state.context(), &request).await)
}

async fn get_capacity(
    State(state): State<AppState>,
    Json(request): Json<GetCapacityRequest>,
) -> Response {
    respond(
        state
            .service
            .get_capacity(&state.context(), &request)
            .await
            .map(|available_capacity| CapacityResponse { available_capacity }),
    )
}

async fn validate_volume_capabilities(
    State(state): State<AppState>,
    Json(request): Json<ValidateCapabilitiesRequest>,
) -> Response {
    respond(
        state
            .service
            .validate_volume_capabilities(&state.context(), &request)
            .await,
    )
}

async fn controller_publish(
    State(state): State<AppState>,
    Json(request): Json<ControllerPublishRequest>,
) -> Response {
    respond(
        state
            .service
            .controller_publish_volume(&state.context(), &request)
            .await
            .map(|publish_context| PublishResponse { publish_context }),
    )
}

async fn controller_unpublish(
    State(state): State<AppState>,
    Json(request): Json<ControllerUnpublishRequest>,
) -> Response {
    respond(
        state
            .service
            .controller_unpublish_volume(&state.context(), &request)
            .await
            .map(OperationResponse::from),
    )
}

async fn controller_capabilities(State(state): State<AppState>) -> Response {
    respond(state.service.controller_get_capabilities(&state.context()).await)
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn node_publish(
    State(state): State<AppState>,
    Json(request): Json<NodePublishRequest>,
) -> Response {
    respond(
        state
            .service
            .node_publish_volume(&state.context(), &request)
            .await
            .map(OperationResponse::from),
    )
}

async fn node_unpublish(
    State(state): State<AppState>,
    Json(request): Json<NodeUnpublishRequest>,
) -> Response {
    respond(
        state
            .service
            .node_unpublish_volume(&state.context(), &request)
            .await
            .map(OperationResponse::from),
    )
}

async fn node_capabilities(State(state): State<AppState>) -> Response {
    respond(state.service.node_get_capabilities(&state.context()).await)
}

async fn node_info(State(state): State<AppState>) -> Response {
    respond(state.service.node_get_info(&state.context()).await)
}

async fn unsupported_rpc(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(rpc) = UNIMPLEMENTED_RPCS.iter().find(|rpc| **rpc == name) else {
        debug!("Unknown RPC {}", name);
        return (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: Code::NotFound.to_string(),
                message: format!("unknown RPC {}", name),
            }),
        )
            .into_response();
    };
    match state.service.unimplemented(&state.context(), rpc).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Health and Metrics
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.service.metrics().encode() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
