//! Loopback redirect listener for the authorization code flow.
//!
//! Serves one route on localhost; the browser lands here after the user
//! approves access, and the waiting flow is resolved by the `state`
//! parameter.

use crate::error::{OAuthError, OAuthResult};
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Port the redirect URI points at.
pub const CALLBACK_PORT: u16 = 18756;

/// Path the redirect URI points at.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// How long to wait for the user to finish in the browser.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const HTML_SUCCESS: &str = "<!DOCTYPE html>\
<html><head><title>mcpd - Authorized</title></head>\
<body><h1>Authorization complete</h1>\
<p>You can close this window and return to mcpd.</p>\
<script>setTimeout(() => window.close(), 2000);</script></body></html>";

fn html_error(message: &str) -> String {
    let escaped = message
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<!DOCTYPE html><html><head><title>mcpd - Authorization failed</title></head>\
         <body><h1>Authorization failed</h1><p>{escaped}</p></body></html>"
    )
}

/// The redirect URI this listener answers.
pub fn redirect_uri() -> String {
    format!("http://127.0.0.1:{CALLBACK_PORT}{CALLBACK_PATH}")
}

type PendingMap = Arc<RwLock<HashMap<String, oneshot::Sender<Result<String, String>>>>>;

/// Localhost HTTP listener resolving authorization redirects.
pub struct CallbackServer {
    pending: PendingMap,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Default for CallbackServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackServer {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            shutdown: Mutex::new(None),
        }
    }

    /// Bind and serve the callback route. Idempotent; returns Ok if the
    /// listener is already up.
    pub async fn start(&self) -> OAuthResult<()> {
        {
            let shutdown = self.shutdown.lock().await;
            if shutdown.is_some() {
                return Ok(());
            }
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], CALLBACK_PORT));
        let listener = TcpListener::bind(addr).await.map_err(OAuthError::Io)?;
        info!(port = CALLBACK_PORT, "OAuth callback listener started");

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(self.pending.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown.lock().await = Some(shutdown_tx);

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "Callback listener error");
            }
        });

        Ok(())
    }

    /// Wait for the redirect carrying the given state parameter and
    /// return its authorization code.
    pub async fn wait_for_code(&self, state: &str) -> OAuthResult<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(state.to_string(), tx);

        match tokio::time::timeout(CALLBACK_TIMEOUT, rx).await {
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(error))) => Err(OAuthError::InvalidCallback(error)),
            Ok(Err(_)) => {
                self.pending.write().await.remove(state);
                Err(OAuthError::InvalidCallback(
                    "Authorization cancelled".to_string(),
                ))
            }
            Err(_) => {
                self.pending.write().await.remove(state);
                Err(OAuthError::InvalidCallback(
                    "Timed out waiting for authorization".to_string(),
                ))
            }
        }
    }

    /// Abort a pending wait.
    pub async fn cancel(&self, state: &str) {
        if let Some(sender) = self.pending.write().await.remove(state) {
            let _ = sender.send(Err("Authorization cancelled".to_string()));
        }
    }

    /// Stop the listener, failing any pending waits.
    pub async fn stop(&self) {
        if let Some(sender) = self.shutdown.lock().await.take() {
            let _ = sender.send(());
        }
        let mut pending = self.pending.write().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err("Callback listener stopped".to_string()));
        }
    }
}

async fn handle_callback(
    State(pending): State<PendingMap>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<String> {
    debug!(
        has_code = params.contains_key("code"),
        has_error = params.contains_key("error"),
        "Received authorization redirect"
    );

    let Some(state) = params.get("state") else {
        return Html(html_error("Missing state parameter"));
    };
    let Some(sender) = pending.write().await.remove(state) else {
        return Html(html_error("Unknown or expired authorization attempt"));
    };

    if let Some(error) = params.get("error") {
        let message = params
            .get("error_description")
            .unwrap_or(error)
            .to_string();
        let _ = sender.send(Err(message.clone()));
        return Html(html_error(&message));
    }

    let Some(code) = params.get("code") else {
        let _ = sender.send(Err("No authorization code in redirect".to_string()));
        return Html(html_error("No authorization code in redirect"));
    };

    let _ = sender.send(Ok(code.clone()));
    Html(HTML_SUCCESS.to_string())
}
