//! Config API Handlers
//!
//! Snapshot reads and publishes, history, environment resolution, and the
//! three delivery modes for change notifications: server-sent events,
//! long-poll and webhooks.

use super::rest::{ApiError, ApiResult, AppState};
use crate::config::{ConfigChange, ConfigEntries, ConfigKey, ConfigSnapshot, SubscriptionHandle};
use crate::error::Error;
use axum::{
    extract::{rejection::JsonRejection, Json, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Version of the returned snapshot
pub const CONFIG_VERSION_HEADER: &str = "x-config-version";

/// SSE event name for change notifications
pub const CHANGE_EVENT: &str = "config-change";

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;
const MAX_POLL_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query for streaming subscriptions
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    pub last_seen_version: Option<u64>,
    pub client_id: Option<String>,
}

/// Query for long-poll
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollQuery {
    pub last_seen_version: Option<u64>,
    pub client_id: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Webhook registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    pub url: String,
    pub client_id: String,
    #[serde(default)]
    pub last_seen_version: Option<u64>,
}

/// Retained history of a key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionsResponse {
    pub application: String,
    pub profile: String,
    pub label: String,
    pub versions: Vec<u64>,
}

/// Path segments addressing a config key
#[derive(Debug, Clone, Deserialize)]
pub struct KeyPath {
    pub application: String,
    pub profile: String,
    pub label: String,
}

impl KeyPath {
    fn key(&self) -> Result<ConfigKey, Error> {
        ConfigKey::parse(&self.application, &self.profile, &self.label)
    }
}

/// Key path plus a version segment
#[derive(Debug, Clone, Deserialize)]
pub struct VersionPath {
    pub application: String,
    pub profile: String,
    pub label: String,
    pub version: u64,
}

// =============================================================================
// Routes
// =============================================================================

/// Config routes, merged into the main router
pub fn config_routes() -> Router<AppState> {
    Router::new()
        .route("/config", get(list_config_keys))
        .route(
            "/config/:application/:profile/:label",
            get(get_latest_config).post(publish_config),
        )
        .route("/config/:application/:profile/:label/versions", get(list_versions))
        .route(
            "/config/:application/:profile/:label/versions/:version",
            get(get_config_version),
        )
        .route("/config/:application/:profile/:label/subscribe", get(subscribe_sse))
        .route("/config/:application/:profile/:label/poll", get(long_poll))
        .route(
            "/config/:application/:profile/:label/webhooks",
            post(register_webhook),
        )
        .route("/webhooks", get(list_webhooks))
        .route("/webhooks/:id", delete(remove_webhook))
        .route("/env/:application/:profiles/:label", get(resolve_environment))
}

fn snapshot_response(status: StatusCode, snapshot: Arc<ConfigSnapshot>) -> Response {
    let version = snapshot.version;
    let mut response = (status, Json(snapshot)).into_response();
    response
        .headers_mut()
        .insert(CONFIG_VERSION_HEADER, HeaderValue::from(version));
    response
}

/// Parse a version out of `If-Match` / `Last-Event-ID`, quoted or not
fn header_version(headers: &HeaderMap, name: &str) -> ApiResult<Option<u64>> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| Error::Validation(format!("invalid {} header", name)))?
        .trim()
        .trim_start_matches("W/")
        .trim_matches('"');
    text.parse::<u64>()
        .map(Some)
        .map_err(|_| ApiError(Error::Validation(format!("{} must be a version number: {}", name, text))))
}

// =============================================================================
// Snapshot Handlers
// =============================================================================

/// Every known key
async fn list_config_keys(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.node.config_store().list_keys()))
}

/// Latest snapshot
async fn get_latest_config(
    State(state): State<AppState>,
    Path(path): Path<KeyPath>,
) -> ApiResult<Response> {
    let snapshot = state.node.config_store().get_latest(&path.key()?)?;
    Ok(snapshot_response(StatusCode::OK, snapshot))
}

/// Publish a new version; `If-Match` makes it compare-and-set
async fn publish_config(
    State(state): State<AppState>,
    Path(path): Path<KeyPath>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ConfigEntries>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(entries) = payload?;
    let key = path.key()?;
    let store = state.node.config_store();

    let snapshot = match header_version(&headers, header::IF_MATCH.as_str())? {
        Some(expected) => store.publish_expecting(&key, entries, expected).await?,
        None => store.publish(&key, entries).await?,
    };
    Ok(snapshot_response(StatusCode::CREATED, snapshot))
}

/// Retained versions
async fn list_versions(
    State(state): State<AppState>,
    Path(path): Path<KeyPath>,
) -> ApiResult<impl IntoResponse> {
    let key = path.key()?;
    let versions = state.node.config_store().retained_versions(&key);
    if versions.is_empty() {
        return Err(Error::not_found("ConfigSnapshot", key.to_string()).into());
    }
    Ok((
        StatusCode::OK,
        Json(VersionsResponse {
            application: key.application,
            profile: key.profile,
            label: key.label,
            versions,
        }),
    ))
}

/// One historical version
async fn get_config_version(
    State(state): State<AppState>,
    Path(path): Path<VersionPath>,
) -> ApiResult<Response> {
    let key = ConfigKey::parse(&path.application, &path.profile, &path.label)?;
    let snapshot = state.node.config_store().get_version(&key, path.version)?;
    Ok(snapshot_response(StatusCode::OK, snapshot))
}

/// Layered environment; `profiles` is comma-separated
async fn resolve_environment(
    State(state): State<AppState>,
    Path((application, profiles, label)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let profiles: Vec<String> = profiles
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    let environment = state
        .node
        .config_store()
        .environment(&application, &profiles, &label)?;
    Ok((StatusCode::OK, Json(environment)))
}

// =============================================================================
// Delivery Handlers
// =============================================================================

fn client_id(requested: Option<String>, mode: &str) -> String {
    requested
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| format!("{}-anonymous", mode))
}

fn change_event(change: &ConfigChange) -> Event {
    let event = Event::default()
        .id(change.version.to_string())
        .event(CHANGE_EVENT);
    match event.json_data(change) {
        Ok(event) => event,
        // Serializing plain strings cannot fail; fall back to the bare version
        Err(_) => Event::default()
            .id(change.version.to_string())
            .event(CHANGE_EVENT)
            .data(change.version.to_string()),
    }
}

/// Stream changes; each one is acknowledged once handed to the connection
///
/// The ack happens before the bytes reach the client, so a dropped
/// connection can lose the tail. At-least-once delivery relies on the client
/// reconnecting with `Last-Event-ID`, which replays everything after it.
fn change_stream(handle: SubscriptionHandle) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(handle, |handle| async move {
        let change = handle.next().await?;
        handle.ack(change.version);
        Some((Ok(change_event(&change)), handle))
    })
}

/// Server-sent event stream of changes
///
/// Resumes after `Last-Event-ID` or `lastSeenVersion`; with neither, the
/// current version is sent first.
async fn subscribe_sse(
    State(state): State<AppState>,
    Path(path): Path<KeyPath>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let key = path.key()?;
    let store = state.node.config_store();

    let last_seen = match header_version(&headers, "last-event-id")?.or(query.last_seen_version) {
        Some(version) => version,
        None => store
            .get_latest(&key)
            .map(|s| s.version.saturating_sub(1))
            .unwrap_or(0),
    };

    let handle = store
        .subscribe(client_id(query.client_id, "sse"), &key, Some(last_seen))
        .await?;
    debug!(key = %key, last_seen, subscription_id = handle.id(), "SSE subscriber connected");

    Ok(Sse::new(change_stream(handle)).keep_alive(KeepAlive::default()))
}

/// Wait for the next change after `lastSeenVersion`; 304 on timeout
async fn long_poll(
    State(state): State<AppState>,
    Path(path): Path<KeyPath>,
    Query(query): Query<PollQuery>,
) -> ApiResult<Response> {
    let key = path.key()?;
    let timeout = Duration::from_secs(
        query
            .timeout_secs
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS)
            .min(MAX_POLL_TIMEOUT_SECS),
    );

    let handle = state
        .node
        .config_store()
        .subscribe(client_id(query.client_id, "poll"), &key, query.last_seen_version)
        .await?;

    match tokio::time::timeout(timeout, handle.next()).await {
        Ok(Some(change)) => {
            handle.ack(change.version);
            let version = change.version;
            let mut response = (StatusCode::OK, Json(change)).into_response();
            response
                .headers_mut()
                .insert(CONFIG_VERSION_HEADER, HeaderValue::from(version));
            Ok(response)
        }
        Ok(None) => Err(Error::unavailable("config notifier", "subscription closed").into()),
        Err(_) => Ok(StatusCode::NOT_MODIFIED.into_response()),
    }
}

/// Register a push-mode subscription
async fn register_webhook(
    State(state): State<AppState>,
    Path(path): Path<KeyPath>,
    payload: std::result::Result<Json<WebhookRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let key = path.key()?;
    if request.client_id.trim().is_empty() {
        return Err(Error::Validation("clientId must not be empty".into()).into());
    }
    let info = state
        .node
        .add_webhook(&key, &request.client_id, &request.url, request.last_seen_version)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn list_webhooks(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.node.webhooks()))
}

async fn remove_webhook(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    if state.node.remove_webhook(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("Webhook", id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::api::rest::tests::{body_json, empty_request, json_request, router, test_node};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use futures::StreamExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_publish_then_read_latest_and_history() {
        let node = test_node().await;
        let app = router(&node);

        for value in ["1", "2"] {
            let response = app
                .clone()
                .oneshot(json_request(
                    Method::POST,
                    "/config/orders/prod/main",
                    serde_json::json!({"x": value}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/config/orders/prod/main"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONFIG_VERSION_HEADER], "2");
        assert_eq!(body_json(response).await["entries"]["x"], "2");

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/config/orders/prod/main/versions/1"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["entries"]["x"], "1");

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/config/orders/prod/main/versions"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["versions"], serde_json::json!([1, 2]));

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/config/billing/prod/main"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_if_match_conflict() {
        let node = test_node().await;
        let app = router(&node);

        let publish = |if_match: &str, value: &str| {
            Request::builder()
                .method(Method::POST)
                .uri("/config/orders/prod/main")
                .header("content-type", "application/json")
                .header("if-match", if_match)
                .body(Body::from(serde_json::json!({ "x": value }).to_string()))
                .unwrap()
        };

        let response = app.clone().oneshot(publish("0", "1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.clone().oneshot(publish("\"0\"", "2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "conflict");

        let response = app.clone().oneshot(publish("\"1\"", "2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_long_poll_returns_change_or_not_modified() {
        let node = test_node().await;
        let app = router(&node);
        let key = ConfigKey::new("orders", "prod", "main");
        let mut entries = ConfigEntries::new();
        entries.insert("x".into(), "1".into());
        node.config_store().publish(&key, entries.clone()).await.unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(
                Method::GET,
                "/config/orders/prod/main/poll?lastSeenVersion=0&timeoutSecs=1",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["version"], 1);

        let response = app
            .clone()
            .oneshot(empty_request(
                Method::GET,
                "/config/orders/prod/main/poll?lastSeenVersion=1&timeoutSecs=0",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let waiting = tokio::spawn(app.clone().oneshot(empty_request(
            Method::GET,
            "/config/orders/prod/main/poll?lastSeenVersion=1&timeoutSecs=5",
        )));
        tokio::time::sleep(Duration::from_millis(50)).await;
        entries.insert("x".into(), "2".into());
        node.config_store().publish(&key, entries).await.unwrap();

        let response = waiting.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONFIG_VERSION_HEADER], "2");
        assert!(node.notifier().is_empty());
    }

    #[tokio::test]
    async fn test_sse_stream_resumes_from_last_event_id() {
        let node = test_node().await;
        let key = ConfigKey::new("orders", "prod", "main");
        for i in 1..=3 {
            let mut entries = ConfigEntries::new();
            entries.insert("x".into(), i.to_string());
            node.config_store().publish(&key, entries).await.unwrap();
        }

        let handle = node
            .config_store()
            .subscribe("sse-test", &key, Some(1))
            .await
            .unwrap();
        let events: Vec<_> = change_stream(handle).take(2).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(Result::is_ok));
        assert_eq!(node.notifier().stats().acked, 2);

        let response = router(&node)
            .oneshot(
                Request::builder()
                    .uri("/config/orders/prod/main/subscribe")
                    .header("last-event-id", "2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("id: 3"), "unexpected frame: {}", text);
        assert!(text.contains("event: config-change"));
    }

    #[tokio::test]
    async fn test_environment_and_webhook_routes() {
        let node = test_node().await;
        let app = router(&node);

        for (uri, body) in [
            ("/config/application/default/main", serde_json::json!({"timeout": "5"})),
            ("/config/orders/prod/main", serde_json::json!({"db.url": "prod-db"})),
        ] {
            app.clone().oneshot(json_request(Method::POST, uri, body)).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/env/orders/prod/main"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["propertySources"][0]["name"], "orders/prod/main");
        assert_eq!(body["propertySources"][1]["name"], "application/default/main");

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/config/orders/prod/main/webhooks",
                serde_json::json!({"url": "http://127.0.0.1:9/hook", "clientId": "hook-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["id"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(Method::DELETE, &format!("/webhooks/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(empty_request(Method::DELETE, &format!("/webhooks/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
