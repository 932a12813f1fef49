//! HTTP/SSE transport for network-reachable MCP servers.
//!
//! Outbound calls are plain HTTP POSTs. Inbound push messages arrive on
//! a persistent SSE stream that survives reconnects without duplicating
//! already-delivered messages (dedupe by event id).

use crate::backoff::RateLimitInfo;
use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcRequest, ServerMessage};
use crate::transport::{SeenIds, SseParser, Transport, TransportEvent};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the inbound event channel.
const INBOUND_CAPACITY: usize = 256;

/// Delay between SSE stream reconnect attempts.
const STREAM_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Consecutive stream failures tolerated before the transport reports
/// itself failed.
const STREAM_MAX_FAILURES: u32 = 3;

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// The server URL (e.g. `https://mcp.example.com/mcp`).
    pub url: String,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            headers: HashMap::new(),
            timeout_secs: 60,
        }
    }
}

/// HTTP/SSE transport.
pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    auth_token: RwLock<Option<String>>,
    client: Client,
    inbound: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    seen: Arc<Mutex<SeenIds>>,
    cancel: CancellationToken,
}

impl HttpTransport {
    /// Create a new HTTP transport and start its event stream.
    pub fn connect(config: HttpConfig) -> McpResult<Arc<Self>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| McpError::transport(format!("Failed to create HTTP client: {e}")))?;

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        let transport = Arc::new(Self {
            url: config.url,
            headers: config.headers,
            auth_token: RwLock::new(config.auth_token),
            client,
            inbound,
            connected: AtomicBool::new(true),
            seen: Arc::new(Mutex::new(SeenIds::default())),
            cancel: CancellationToken::new(),
        });

        let stream_transport = transport.clone();
        tokio::spawn(async move {
            stream_transport.event_stream_loop().await;
        });

        Ok(transport)
    }

    async fn bearer(&self) -> Option<String> {
        self.auth_token.read().await.clone()
    }

    async fn build_request(&self, body: String) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        for (key, value) in &self.headers {
            req = req.header(key, value);
        }

        if let Some(token) = self.bearer().await {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        req
    }

    /// Long-lived GET of the server's event stream, reconnecting with a
    /// short delay. Delivered event ids persist across reconnects so no
    /// message is duplicated.
    async fn event_stream_loop(self: Arc<Self>) {
        let mut failures: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.read_event_stream().await {
                Ok(()) => {
                    // Clean end of stream; reconnect.
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    debug!(error = %e, failures, "Event stream error");
                    if failures >= STREAM_MAX_FAILURES {
                        self.connected.store(false, Ordering::SeqCst);
                        let _ = self
                            .inbound
                            .send(TransportEvent::Failed(format!("Event stream lost: {e}")));
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

    async fn read_event_stream(&self) -> McpResult<()> {
        let mut req = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream");

        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        if let Some(token) = self.bearer().await {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(last) = self.seen.lock().await.last() {
            req = req.header("Last-Event-ID", last.to_string());
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpError::transport(format!("Event stream connect failed: {e}")))?;

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
                _ = self.cancel.cancelled() => return Ok(()),
            };

            let Some(chunk) = chunk else {
                return Ok(());
            };
            let chunk =
                chunk.map_err(|e| McpError::transport(format!("Event stream read: {e}")))?;

            for event in parser.push(&chunk) {
                self.deliver(event.id.as_deref(), &event.data).await;
            }
        }
    }

    /// Decode and broadcast one inbound frame, deduping by event id.
    async fn deliver(&self, event_id: Option<&str>, data: &str) {
        if data.is_empty() {
            return;
        }
        if let Some(id) = event_id {
            if !self.seen.lock().await.insert(id) {
                debug!(event_id = id, "Skipping already-delivered event");
                return;
            }
        }
        match ServerMessage::decode(data) {
            Ok(message) => {
                let _ = self.inbound.send(TransportEvent::Message(message));
            }
            Err(e) => warn!(error = %e, "Discarding undecodable frame"),
        }
    }

    /// Map an error-status response to the error taxonomy.
    fn status_error(response: &reqwest::Response) -> McpError {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                McpError::auth(format!("Server returned {status}"))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)));
                McpError::RateLimited {
                    retry_after: RateLimitInfo::from_headers(headers)
                        .and_then(|info| info.retry_after()),
                }
            }
            s if s.is_server_error() => McpError::transport(format!("Server returned {status}")),
            _ => McpError::protocol(format!("Server returned {status}")),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, frame: JsonRpcRequest) -> McpResult<()> {
        let body = serde_json::to_string(&frame)?;
        debug!(id = ?frame.id, method = %frame.method, "Sending HTTP request");

        let response = self.build_request(body).await.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else if e.is_connect() {
                McpError::transport(format!("Connection failed: {e}"))
            } else {
                McpError::transport(format!("Request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            return Err(Self::status_error(&response));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            // The response arrives as a short-lived SSE stream; pump it
            // into the inbound channel like any other push delivery.
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| McpError::transport(format!("Response stream: {e}")))?;
                for event in parser.push(&chunk) {
                    self.deliver(event.id.as_deref(), &event.data).await;
                }
            }
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol(format!("Failed to read response: {e}")))?;
            if !text.trim().is_empty() {
                self.deliver(None, text.trim()).await;
            }
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inbound.subscribe()
    }

    async fn set_auth_token(&self, token: String) {
        *self.auth_token.write().await = Some(token);
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        debug!("Closed HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_default() {
        let config = HttpConfig::default();
        assert!(config.url.is_empty());
        assert!(config.auth_token.is_none());
        assert_eq!(config.timeout_secs, 60);
    }

    #[tokio::test]
    async fn test_transport_starts_connected() {
        let config = HttpConfig {
            url: "http://127.0.0.1:1/mcp".to_string(),
            ..Default::default()
        };
        let transport = HttpTransport::connect(config).unwrap();
        assert!(transport.is_connected());
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_connection_refused() {
        let config = HttpConfig {
            url: "http://127.0.0.1:1/mcp".to_string(),
            timeout_secs: 1,
            ..Default::default()
        };
        let transport = HttpTransport::connect(config).unwrap();

        let result = transport
            .send(JsonRpcRequest::new(1, "initialize", None))
            .await;
        assert!(result.is_err());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_auth_token() {
        let config = HttpConfig {
            url: "http://127.0.0.1:1/mcp".to_string(),
            ..Default::default()
        };
        let transport = HttpTransport::connect(config).unwrap();
        assert!(transport.bearer().await.is_none());

        transport.set_auth_token("token123".to_string()).await;
        assert_eq!(transport.bearer().await.as_deref(), Some("token123"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deliver_dedupes_by_event_id() {
        let config = HttpConfig {
            url: "http://127.0.0.1:1/mcp".to_string(),
            ..Default::default()
        };
        let transport = HttpTransport::connect(config).unwrap();
        let mut rx = transport.subscribe();

        let frame = r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#;
        transport.deliver(Some("evt_1"), frame).await;
        transport.deliver(Some("evt_1"), frame).await;
        transport.deliver(Some("evt_2"), frame).await;

        // Exactly two deliveries: the duplicate id is dropped.
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::Message(ServerMessage::Notification(_))
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::Message(ServerMessage::Notification(_))
        ));
        assert!(rx.try_recv().is_err());
        transport.close().await.unwrap();
    }
}
