//! REST API Handlers
//!
//! Registry, peer replication and health endpoints. Config endpoints live in
//! [`super::config`]; both share [`AppState`] and the error mapping here.

use super::config::config_routes;
use crate::controlplane::node::RegistryNode;
use crate::error::Error;
use crate::registry::{InstanceRegistration, InstanceStatus, RegistryEvent, ReplicationOutcome};
use crate::replication::{PeerAnnouncement, PeerState};
use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Status override request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    pub status: InstanceStatus,
}

/// Cancel response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub instance_id: String,
    /// False if the instance was already gone
    pub cancelled: bool,
}

/// Replication push response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicateResponse {
    /// `applied` or `stale`
    pub outcome: String,
}

/// Announce response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceResponse {
    pub url: String,
    pub previous_state: Option<PeerState>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Handler error carrying a crate [`Error`]
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(Error::Validation(rejection.body_text()))
    }
}

/// HTTP status for an error
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Conflict { .. } => StatusCode::CONFLICT,
        Error::Rejected { .. } => StatusCode::BAD_GATEWAY,
        Error::Unavailable { .. } | Error::PeerPush { .. } | Error::Delivery { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::Validation(_) | Error::JsonParse(_) | Error::YamlParse(_) => StatusCode::BAD_REQUEST,
        Error::Configuration(_) | Error::Internal(_) | Error::Http(_) | Error::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        }
        let details = match &self.0 {
            Error::Conflict { actual, .. } => Some(format!("latestVersion={}", actual)),
            _ => None,
        };
        (
            status,
            Json(ApiErrorResponse {
                error: self.0.code().to_string(),
                message: self.0.to_string(),
                details,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    node: Arc<RegistryNode>,
    request_timeout: Duration,
    cors_permissive: bool,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(node: Arc<RegistryNode>, request_timeout: Duration) -> Self {
        Self {
            node,
            request_timeout,
            cors_permissive: false,
        }
    }

    /// Allow cross-origin requests from anywhere
    pub fn with_permissive_cors(mut self, enabled: bool) -> Self {
        self.cors_permissive = enabled;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState { node: self.node };

        // Bounded latency for registry calls; streaming config routes are exempt
        let registry = Router::new()
            .route("/registry/instances", post(register_instance))
            .route(
                "/registry/instances/:id",
                get(get_instance).delete(cancel_instance),
            )
            .route("/registry/instances/:id/renew", put(renew_instance))
            .route("/registry/instances/:id/status", put(set_instance_status))
            .route("/registry/apps", get(list_applications))
            .route("/registry/apps/:app_name", get(lookup_application))
            .route("/registry/replicate", post(replicate_event))
            .route("/registry/peers", get(list_peers))
            .route("/registry/peers/announce", post(announce_peer))
            .layer(TimeoutLayer::new(self.request_timeout));

        let router = Router::new()
            .merge(registry)
            .merge(config_routes())
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/status", get(node_status))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if self.cors_permissive {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<RegistryNode>,
}

// =============================================================================
// Registry Handlers
// =============================================================================

/// Register an instance
async fn register_instance(
    State(state): State<AppState>,
    payload: std::result::Result<Json<InstanceRegistration>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(registration) = payload?;
    let instance = state.node.registry().register(registration)?;
    Ok((StatusCode::OK, Json(instance)))
}

/// Renew a lease
async fn renew_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let registry = state.node.registry();
    registry.renew(id.as_str())?;
    let instance = registry
        .get(id.as_str())
        .ok_or_else(|| Error::not_found("Instance", id.as_str()))?;
    Ok((StatusCode::OK, Json(instance)))
}

/// Override an instance's status
async fn set_instance_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let instance = state.node.registry().set_status(id.as_str(), request.status)?;
    Ok((StatusCode::OK, Json(instance)))
}

/// Deregister an instance (idempotent)
async fn cancel_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.node.registry().cancel(id.as_str());
    (
        StatusCode::OK,
        Json(CancelResponse {
            instance_id: id,
            cancelled,
        }),
    )
}

/// Get one instance, whatever its status
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .node
        .registry()
        .get(id.as_str())
        .ok_or_else(|| Error::not_found("Instance", id.as_str()))?;
    Ok((StatusCode::OK, Json(instance)))
}

/// Instance counts per application
async fn list_applications(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.node.registry().applications()))
}

/// UP instances of an application
async fn lookup_application(
    State(state): State<AppState>,
    Path(app_name): Path<String>,
) -> impl IntoResponse {
    (StatusCode::OK, Json(state.node.registry().lookup(&app_name)))
}

// =============================================================================
// Peer Handlers
// =============================================================================

/// Apply an event pushed by a peer
async fn replicate_event(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegistryEvent>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(event) = payload?;
    let outcome = match state.node.apply_peer_event(event)? {
        ReplicationOutcome::Applied => "applied",
        ReplicationOutcome::Stale => "stale",
    };
    Ok((
        StatusCode::OK,
        Json(ReplicateResponse {
            outcome: outcome.to_string(),
        }),
    ))
}

/// A peer (re)announces itself
async fn announce_peer(
    State(state): State<AppState>,
    payload: std::result::Result<Json<PeerAnnouncement>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(announcement) = payload?;
    let previous_state = state.node.announce_peer(&announcement.url)?;
    Ok((
        StatusCode::OK,
        Json(AnnounceResponse {
            url: announcement.url,
            previous_state,
        }),
    ))
}

/// Peer replication states
async fn list_peers(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.node.replicator().peer_info()))
}

// =============================================================================
// Health Handlers
// =============================================================================

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.node.is_ready().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "config backend unavailable")
    }
}

/// Node summary
async fn node_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.node.status().await))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::MemoryBackend;
    use crate::controlplane::node::NodeConfig;
    use crate::domain::clock::system_clock;
    use crate::domain::ports::PeerTransport;
    use crate::error::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    struct NoopTransport;

    #[async_trait]
    impl PeerTransport for NoopTransport {
        async fn push(&self, _peer_url: &str, _event: &RegistryEvent) -> Result<()> {
            Ok(())
        }

        async fn announce(&self, _peer_url: &str, _self_url: &str) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) async fn test_node() -> Arc<RegistryNode> {
        RegistryNode::with_parts(
            NodeConfig::default(),
            Arc::new(NoopTransport),
            Arc::new(MemoryBackend::new()),
            system_clock(),
        )
        .await
        .unwrap()
    }

    pub(crate) fn router(node: &Arc<RegistryNode>) -> Router {
        RestRouter::new(node.clone(), Duration::from_secs(5)).build()
    }

    pub(crate) fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub(crate) fn empty_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    pub(crate) async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn registration(id: &str) -> serde_json::Value {
        serde_json::json!({
            "instanceId": id,
            "appName": "orders",
            "host": "10.0.0.1",
            "port": 8080,
            "metadata": {"zone": "a"}
        })
    }

    #[tokio::test]
    async fn test_register_renew_lookup_cancel() {
        let node = test_node().await;
        let app = router(&node);

        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/registry/instances", registration("svc-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "STARTING");

        // STARTING instances are not discoverable yet
        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/registry/apps/orders"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([]));

        let response = app
            .clone()
            .oneshot(empty_request(Method::PUT, "/registry/instances/svc-1/renew"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/registry/apps/orders"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body[0]["instanceId"], "svc-1");
        assert_eq!(body[0]["status"], "UP");

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(empty_request(Method::DELETE, "/registry/instances/svc-1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert!(node.registry().is_empty());
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let node = test_node().await;
        let app = router(&node);

        let response = app
            .clone()
            .oneshot(empty_request(Method::PUT, "/registry/instances/ghost/renew"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "not_found");

        let mut bad = registration("svc-1");
        bad["port"] = serde_json::json!(0);
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/registry/instances", bad))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/registry/instances")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "validation_failed");
    }

    #[tokio::test]
    async fn test_status_override_and_peer_endpoints() {
        let node = test_node().await;
        let app = router(&node);

        app.clone()
            .oneshot(json_request(Method::POST, "/registry/instances", registration("svc-1")))
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/registry/instances/svc-1/status",
                serde_json::json!({"status": "OUT_OF_SERVICE"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "OUT_OF_SERVICE");

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/registry/peers/announce",
                serde_json::json!({"url": "http://peer-b:8761"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/registry/peers"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await[0]["url"], "http://peer-b:8761");

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/ready"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_replicate_endpoint_applies_last_writer() {
        let node = test_node().await;
        let app = router(&node);
        let now = chrono::Utc::now();

        let register = serde_json::json!({
            "kind": "REGISTER",
            "instanceId": "svc-9",
            "appName": "billing",
            "timestamp": now,
            "instance": {
                "instanceId": "svc-9",
                "appName": "billing",
                "host": "10.0.0.9",
                "port": 9000,
                "status": "UP",
                "lastRenewal": now,
                "registeredAt": now,
                "lastUpdated": now,
                "metadata": {}
            }
        });
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/registry/replicate", register))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["outcome"], "applied");
        assert_eq!(node.registry().lookup("billing").len(), 1);

        let stale_cancel = serde_json::json!({
            "kind": "CANCEL",
            "instanceId": "svc-9",
            "appName": "billing",
            "timestamp": now - chrono::Duration::seconds(10)
        });
        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/registry/replicate", stale_cancel))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["outcome"], "stale");
        assert!(node.registry().contains("svc-9"));
    }
}
