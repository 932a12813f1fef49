//! Pipe transport, reached through the bridging proxy.
//!
//! A stdio-only MCP server runs as a child of the proxy daemon; this
//! transport talks to it over the proxy's HTTP surface. Outbound frames
//! go to the send endpoint, inbound frames arrive on the per-server
//! event stream.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, ServerMessage};
use crate::transport::{SeenIds, SseParser, Transport, TransportEvent};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INBOUND_CAPACITY: usize = 256;

const STREAM_RECONNECT_DELAY: Duration = Duration::from_millis(500);

const STREAM_MAX_FAILURES: u32 = 3;

/// Proxy transport configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL of the proxy daemon (e.g. `http://127.0.0.1:8632`).
    pub proxy_url: String,
    /// Identifier of the child server registered with the proxy.
    pub server_id: String,
    /// API key for the proxy, if it requires one.
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_url: "http://127.0.0.1:8632".to_string(),
            server_id: String::new(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

/// Transport for a stdio child bridged by the proxy daemon.
pub struct ProxyTransport {
    config: ProxyConfig,
    client: Client,
    inbound: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    seen: Arc<Mutex<SeenIds>>,
    auth_token: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl ProxyTransport {
    /// Create a proxy transport and start following the server's event
    /// stream.
    pub fn connect(config: ProxyConfig) -> McpResult<Arc<Self>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| McpError::transport(format!("Failed to create HTTP client: {e}")))?;

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        let transport = Arc::new(Self {
            config,
            client,
            inbound,
            connected: AtomicBool::new(true),
            seen: Arc::new(Mutex::new(SeenIds::default())),
            auth_token: RwLock::new(None),
            cancel: CancellationToken::new(),
        });

        let stream_transport = transport.clone();
        tokio::spawn(async move {
            stream_transport.event_stream_loop().await;
        });

        Ok(transport)
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/servers/{}/{suffix}",
            self.config.proxy_url.trim_end_matches('/'),
            self.config.server_id
        )
    }

    fn with_api_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }

    async fn event_stream_loop(self: Arc<Self>) {
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.read_event_stream().await {
                Ok(stopped) => {
                    if stopped {
                        // The child exited; the proxy never restarts it,
                        // so there is nothing to resume.
                        return;
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    debug!(error = %e, failures, "Proxy event stream error");
                    if failures >= STREAM_MAX_FAILURES {
                        self.connected.store(false, Ordering::SeqCst);
                        let _ = self
                            .inbound
                            .send(TransportEvent::Failed(format!("Proxy unreachable: {e}")));
                        return;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(STREAM_RECONNECT_DELAY) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// Follow the event stream until it ends. Returns true when the
    /// child process terminated, in which case this transport is done.
    async fn read_event_stream(&self) -> McpResult<bool> {
        let mut req = self
            .client
            .get(self.endpoint("events"))
            .header("Accept", "text/event-stream");
        if let Some(last) = self.seen.lock().await.last() {
            req = req.header("Last-Event-ID", last.to_string());
        }
        let response = self
            .with_api_key(req)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("Event stream connect failed: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.inbound.send(TransportEvent::Failed(
                "Server not registered with proxy".to_string(),
            ));
            return Ok(true);
        }
        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "Event stream returned {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.cancel.cancelled() => return Ok(true),
            };
            let Some(chunk) = chunk else {
                return Ok(false);
            };
            let chunk =
                chunk.map_err(|e| McpError::transport(format!("Event stream read: {e}")))?;

            for event in parser.push(&chunk) {
                if self.handle_event(event.id.as_deref(), event.event.as_deref(), &event.data)
                    .await
                {
                    return Ok(true);
                }
            }
        }
    }

    /// Dispatch one proxy event. Returns true when the child is gone.
    async fn handle_event(&self, id: Option<&str>, kind: Option<&str>, data: &str) -> bool {
        if let Some(id) = id {
            if !self.seen.lock().await.insert(id) {
                debug!(event_id = id, "Skipping already-delivered event");
                return false;
            }
        }

        match kind.unwrap_or("message") {
            "message" => {
                match ServerMessage::decode(data) {
                    Ok(message) => {
                        let _ = self.inbound.send(TransportEvent::Message(message));
                    }
                    Err(e) => warn!(error = %e, "Discarding undecodable frame"),
                }
                false
            }
            "crashed" => {
                self.connected.store(false, Ordering::SeqCst);
                let _ = self.inbound.send(TransportEvent::Failed(format!(
                    "Server process crashed: {data}"
                )));
                true
            }
            "stopped" => {
                self.connected.store(false, Ordering::SeqCst);
                let _ = self
                    .inbound
                    .send(TransportEvent::Failed("Server process stopped".to_string()));
                true
            }
            "stderr" => {
                debug!(server_id = %self.config.server_id, line = data, "Server stderr");
                false
            }
            other => {
                debug!(kind = other, "Ignoring unknown proxy event");
                false
            }
        }
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    async fn send(&self, frame: JsonRpcRequest) -> McpResult<()> {
        let body = serde_json::to_string(&frame)?;
        debug!(
            server_id = %self.config.server_id,
            id = ?frame.id,
            method = %frame.method,
            "Sending frame via proxy"
        );

        let req = self
            .client
            .post(self.endpoint("send"))
            .header("Content-Type", "application/json")
            .body(body);

        let response = self.with_api_key(req).send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else {
                McpError::transport(format!("Proxy send failed: {e}"))
            }
        })?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(McpError::transport(
                "Server not registered with proxy".to_string(),
            )),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(McpError::auth("Proxy rejected API key".to_string()))
            }
            status => Err(McpError::transport(format!("Proxy returned {status}"))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inbound.subscribe()
    }

    /// Hand a fresh access token to the proxy, which restarts the child
    /// with the new token in its environment.
    async fn set_auth_token(&self, token: String) {
        *self.auth_token.write().await = Some(token.clone());

        let req = self
            .client
            .post(self.endpoint("oauth/refresh"))
            .json(&json!({ "access_token": token }));
        match self.with_api_key(req).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(server_id = %self.config.server_id, "Delivered refreshed token to proxy");
            }
            Ok(response) => {
                warn!(
                    server_id = %self.config.server_id,
                    status = %response.status(),
                    "Proxy rejected refreshed token"
                );
            }
            Err(e) => {
                warn!(server_id = %self.config.server_id, error = %e, "Failed to deliver token");
            }
        }
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);

        // Best-effort deregistration; the proxy reaps the child.
        let url = format!(
            "{}/servers/{}",
            self.config.proxy_url.trim_end_matches('/'),
            self.config.server_id
        );
        let req = self.client.delete(url);
        if let Err(e) = self.with_api_key(req).send().await {
            debug!(error = %e, "Proxy deregistration failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
