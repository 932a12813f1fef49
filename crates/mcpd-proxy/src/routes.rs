//! HTTP surface of the bridging proxy.
//!
//! Server lifecycle and frame delivery are plain JSON routes; inbound
//! frames flow back to clients on a per-server SSE stream that honors
//! `Last-Event-ID` resumption.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::process::{ProxyEvent, SpawnSpec};
use crate::state::ProxyState;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::ServerNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::AlreadyRegistered(_) | ProxyError::NotRunning(_) => StatusCode::CONFLICT,
            ProxyError::Spawn(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProxyError::Io(_) | ProxyError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the proxy router. When the config carries an API key, every
/// route except `/health` requires it (or a trusted `Origin`).
pub fn router(state: ProxyState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut protected = Router::new()
        .route("/servers", get(list_servers).post(register_server))
        .route("/servers/{id}", delete(remove_server))
        .route("/servers/{id}/send", post(send_frame))
        .route("/servers/{id}/events", get(event_stream))
        .route("/servers/{id}/oauth/status", get(oauth_status))
        .route("/servers/{id}/oauth/refresh", post(oauth_refresh));

    if state.config.api_key.is_some() {
        protected = protected.layer(middleware::from_fn_with_state(state.clone(), require_key));
    }

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Bearer token or `x-api-key` header, whichever is present.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn require_key(
    State(state): State<ProxyState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Trusted origins (the local UI, typically) skip the key check.
    if let Some(origin) = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
    {
        if state.config.is_trusted_origin(origin) {
            return next.run(request).await;
        }
    }

    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };
    match extract_api_key(request.headers()) {
        Some(key) if constant_time_eq(key, expected) => next.run(request).await,
        _ => {
            warn!("Rejected request with missing or invalid API key");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid or missing API key" })),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "serverCount": state.processes.running_count().await,
    }))
}

async fn list_servers(State(state): State<ProxyState>) -> Json<serde_json::Value> {
    Json(json!({ "servers": state.processes.list().await }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    id: Option<String>,
    #[serde(flatten)]
    spec: SpawnSpec,
}

async fn register_server(
    State(state): State<ProxyState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, ProxyError> {
    let process = state.processes.spawn(request.id, request.spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": process.id(), "running": true })),
    )
        .into_response())
}

async fn remove_server(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProxyError> {
    state.processes.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Forward one JSON-RPC frame to the child's stdin. The reply, if any,
/// arrives on the event stream, so this returns 202.
async fn send_frame(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    body: String,
) -> Result<StatusCode, ProxyError> {
    let process = state.processes.get(&id).await?;
    process.send(body.trim()).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn event_stream(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ProxyError> {
    let process = state.processes.get(&id).await?;

    let last_seen: Option<u64> = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    // Subscribe before snapshotting the backlog so nothing published in
    // between is lost; live events older than the backlog are skipped.
    let mut live = process.subscribe();
    let backlog = process.replay_after(last_seen).await;
    let mut last_seq = backlog
        .last()
        .map(|e| e.seq)
        .or(last_seen)
        .unwrap_or(0);

    debug!(server_id = %id, resumed_from = ?last_seen, backlog = backlog.len(), "Event stream attached");

    let stream = async_stream::stream! {
        for event in backlog {
            yield Ok(to_sse(&event));
        }
        loop {
            match live.recv().await {
                Ok(event) => {
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    yield Ok(to_sse(&event));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("keep-alive")))
}

fn to_sse(event: &ProxyEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(event.payload.clone())
}

async fn oauth_status(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let process = state.processes.get(&id).await?;
    Ok(Json(json!({
        "hasToken": process.has_token().await,
        "running": process.is_running(),
    })))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    access_token: Option<String>,
}

/// Accept a refreshed access token and relaunch the child with it in
/// the environment.
async fn oauth_refresh(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let process = state.processes.get(&id).await?;
    process.restart_with_token(request.access_token).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProxyConfig;
    use axum_test::TestServer;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;

    fn sleep_script() -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\nsleep 30\n").unwrap();
        let path = file.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn server(config: ProxyConfig) -> TestServer {
        TestServer::new(router(ProxyState::new(config))).unwrap()
    }

    #[tokio::test]
    async fn health_reports_running_count() {
        let server = server(ProxyConfig::default());
        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["serverCount"], 0);
    }

    #[tokio::test]
    async fn register_list_and_remove() {
        let script = sleep_script();
        let server = server(ProxyConfig::default());

        let response = server
            .post("/servers")
            .json(&json!({
                "id": "srv-a",
                "command": script.to_str().unwrap(),
            }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["id"], "srv-a");

        let response = server.get("/servers").await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["servers"][0]["id"], "srv-a");
        assert_eq!(body["servers"][0]["running"], true);

        server
            .delete("/servers/srv-a")
            .await
            .assert_status(StatusCode::NO_CONTENT);
        let response = server.get("/servers").await;
        let body: serde_json::Value = response.json();
        assert!(body["servers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_carries_declared_capabilities() {
        let script = sleep_script();
        let server = server(ProxyConfig::default());

        server
            .post("/servers")
            .json(&json!({
                "id": "srv-caps",
                "command": script.to_str().unwrap(),
                "capabilities": ["tools", "prompts"],
            }))
            .await
            .assert_status(StatusCode::CREATED);

        let response = server.get("/servers").await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["servers"][0]["capabilities"], json!(["tools", "prompts"]));

        // Registrations that declare nothing still expose the field.
        server
            .post("/servers")
            .json(&json!({
                "id": "srv-plain",
                "command": script.to_str().unwrap(),
            }))
            .await
            .assert_status(StatusCode::CREATED);
        let response = server.get("/servers").await;
        let body: serde_json::Value = response.json();
        let plain = body["servers"]
            .as_array()
            .unwrap()
            .iter()
            .find(|s| s["id"] == "srv-plain")
            .unwrap();
        assert_eq!(plain["capabilities"], json!([]));
    }

    #[tokio::test]
    async fn duplicate_live_registration_conflicts() {
        let script = sleep_script();
        let server = server(ProxyConfig::default());
        let payload = json!({ "id": "srv-dup", "command": script.to_str().unwrap() });

        server.post("/servers").json(&payload).await.assert_status(StatusCode::CREATED);
        server
            .post("/servers")
            .json(&payload)
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn send_to_unknown_server_is_404() {
        let server = server(ProxyConfig::default());
        let response = server
            .post("/servers/srv-missing/send")
            .text(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn send_is_accepted_for_running_server() {
        let script = sleep_script();
        let server = server(ProxyConfig::default());
        server
            .post("/servers")
            .json(&json!({ "id": "srv-send", "command": script.to_str().unwrap() }))
            .await
            .assert_status(StatusCode::CREATED);

        let response = server
            .post("/servers/srv-send/send")
            .text(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await;
        response.assert_status(StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn api_key_required_when_configured() {
        let server = server(ProxyConfig::default().with_api_key("secret"));

        server
            .get("/servers")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        server
            .get("/servers")
            .add_header("authorization", "Bearer wrong")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        server
            .get("/servers")
            .add_header("authorization", "Bearer secret")
            .await
            .assert_status_ok();
        server
            .get("/servers")
            .add_header("x-api-key", "secret")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn trusted_origin_bypasses_api_key() {
        let server = server(ProxyConfig::default().with_api_key("secret"));
        server
            .get("/servers")
            .add_header("origin", "http://localhost:5173")
            .await
            .assert_status_ok();
        server
            .get("/servers")
            .add_header("origin", "http://evil.example.com")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_is_open_even_with_api_key() {
        let server = server(ProxyConfig::default().with_api_key("secret"));
        server.get("/health").await.assert_status_ok();
    }

    #[tokio::test]
    async fn oauth_status_reflects_spawn_spec() {
        let script = sleep_script();
        let server = server(ProxyConfig::default());
        server
            .post("/servers")
            .json(&json!({
                "id": "srv-tok",
                "command": script.to_str().unwrap(),
                "accessToken": "tok-1",
            }))
            .await
            .assert_status(StatusCode::CREATED);

        let response = server.get("/servers/srv-tok/oauth/status").await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["hasToken"], true);
        assert_eq!(body["running"], true);
    }

    #[tokio::test]
    async fn oauth_refresh_restarts_with_new_token() {
        let script = sleep_script();
        let server = server(ProxyConfig::default());
        server
            .post("/servers")
            .json(&json!({ "id": "srv-ref", "command": script.to_str().unwrap() }))
            .await
            .assert_status(StatusCode::CREATED);

        server
            .post("/servers/srv-ref/oauth/refresh")
            .json(&json!({ "access_token": "tok-2" }))
            .await
            .assert_status_ok();

        let response = server.get("/servers/srv-ref/oauth/status").await;
        let body: serde_json::Value = response.json();
        assert_eq!(body["hasToken"], true);
        assert_eq!(body["running"], true);
    }
}
