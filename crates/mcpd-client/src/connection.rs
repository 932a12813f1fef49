//! Per-server connection lifecycle.
//!
//! One `ConnectionManager` owns one server's state machine, health
//! probing, and reconnection policy. Lifecycle transitions are
//! published on an event channel; consumers subscribe rather than
//! registering callbacks.

use crate::backoff::BackoffPolicy;
use crate::correlator::RequestCorrelator;
use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    ListToolsResult, McpTool, ServerMessage, ToolCallResult,
};
use crate::transport::{
    HttpConfig, HttpTransport, ProxyConfig, ProxyTransport, Transport, TransportEvent,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between health probes while connected.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for a single health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive probe failures treated as a transport error.
const HEALTH_MAX_FAILURES: u32 = 3;

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 64;

/// How a server is reached.
#[derive(Debug, Clone)]
pub enum TransportKind {
    /// Direct HTTP/SSE endpoint.
    Http {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Child process speaking stdio, bridged by the proxy daemon.
    Pipe {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
}

/// A registered MCP server.
#[derive(Debug, Clone)]
pub struct ServerRegistration {
    /// Stable server identifier; also the tool namespace prefix.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// How to reach the server.
    pub kind: TransportKind,
    /// Capabilities the server declares, surfaced in proxy listings.
    pub capabilities: Vec<String>,
    /// Whether the server requires OAuth credentials.
    pub requires_oauth: bool,
    /// Deadline for the initialize handshake.
    pub handshake_timeout: Duration,
    /// Deadline for an individual request.
    pub request_timeout: Duration,
    /// Cap on concurrent outstanding requests; excess calls queue.
    pub max_concurrent_requests: usize,
    /// Reconnection policy after a transport error.
    pub backoff: BackoffPolicy,
}

impl ServerRegistration {
    /// Registration for a direct HTTP/SSE server.
    pub fn http(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: TransportKind::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            ..Self::base()
        }
    }

    /// Registration for a stdio server reached through the proxy.
    pub fn pipe(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: TransportKind::Pipe {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: TransportKind::Http {
                url: String::new(),
                headers: HashMap::new(),
            },
            requires_oauth: false,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            max_concurrent_requests: 8,
            capabilities: Vec::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the starting state and the user-disconnect state.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; requests flow.
    Connected,
    /// Transport lost; retrying with backoff.
    Reconnecting { attempt: u32 },
    /// Terminal until the user retries.
    Error(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Error(_) => write!(f, "error"),
        }
    }
}

/// Queryable status snapshot for one server.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub last_health_check: Option<Instant>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            reconnect_attempts: 0,
            last_health_check: None,
        }
    }
}

/// Lifecycle events published by a connection manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection entered a new state.
    StateChanged(ConnectionState),
    /// The server pushed a notification.
    Notification(JsonRpcNotification),
    /// The server's tool catalog changed; the registry bridge resyncs.
    ToolsChanged,
}

/// Creates transports for registrations. Swappable so state-machine
/// behavior is testable without network or child processes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        registration: &ServerRegistration,
        access_token: Option<String>,
    ) -> McpResult<Arc<dyn Transport>>;
}

/// Supplies bearer tokens for servers that need them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current access token for a server, if any.
    async fn access_token(&self, server_id: &str) -> McpResult<Option<String>>;

    /// Obtain a fresh access token. Called once after an auth failure.
    async fn refresh_access_token(&self, server_id: &str) -> McpResult<String>;
}

/// Credential provider for servers without authentication.
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn access_token(&self, _server_id: &str) -> McpResult<Option<String>> {
        Ok(None)
    }

    async fn refresh_access_token(&self, server_id: &str) -> McpResult<String> {
        Err(McpError::auth(format!(
            "No credentials configured for server {server_id}"
        )))
    }
}

/// Production transport factory: direct HTTP for `Http` registrations,
/// proxy-bridged pipes for `Pipe` registrations.
pub struct DefaultTransportFactory {
    proxy_url: String,
    proxy_api_key: Option<String>,
    client: reqwest::Client,
}

impl DefaultTransportFactory {
    pub fn new(proxy_url: impl Into<String>, proxy_api_key: Option<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            proxy_api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        registration: &ServerRegistration,
        access_token: Option<String>,
    ) -> McpResult<Arc<dyn Transport>> {
        match &registration.kind {
            TransportKind::Http { url, headers } => {
                let transport = HttpTransport::connect(HttpConfig {
                    url: url.clone(),
                    auth_token: access_token,
                    headers: headers.clone(),
                    timeout_secs: registration.request_timeout.as_secs(),
                })?;
                Ok(transport as Arc<dyn Transport>)
            }
            TransportKind::Pipe { command, args, env } => {
                // Register (or re-register) the child with the proxy,
                // which spawns it and bridges its stdio.
                let mut req = self
                    .client
                    .post(format!("{}/servers", self.proxy_url.trim_end_matches('/')))
                    .json(&json!({
                        "id": registration.id,
                        "command": command,
                        "args": args,
                        "env": env,
                        "capabilities": registration.capabilities,
                        "accessToken": access_token,
                    }));
                if let Some(key) = &self.proxy_api_key {
                    req = req.header("Authorization", format!("Bearer {key}"));
                }
                let response = req
                    .send()
                    .await
                    .map_err(|e| McpError::transport(format!("Proxy unreachable: {e}")))?;
                let status = response.status();
                // 409 means the child is already bridged and running;
                // attach to its event stream instead of failing.
                if !status.is_success() && status != reqwest::StatusCode::CONFLICT {
                    return Err(McpError::transport(format!(
                        "Proxy rejected registration: {status}"
                    )));
                }

                let transport = ProxyTransport::connect(ProxyConfig {
                    proxy_url: self.proxy_url.clone(),
                    server_id: registration.id.clone(),
                    api_key: self.proxy_api_key.clone(),
                    timeout_secs: registration.request_timeout.as_secs(),
                })?;
                Ok(transport as Arc<dyn Transport>)
            }
        }
    }
}

/// Owns one server connection: state machine, correlation, health
/// probing, reconnection.
pub struct ConnectionManager {
    registration: ServerRegistration,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialProvider>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    correlator: Arc<RequestCorrelator>,
    status: RwLock<ConnectionStatus>,
    server_info: RwLock<Option<InitializeResult>>,
    events: broadcast::Sender<ConnectionEvent>,
    permits: Arc<Semaphore>,
    session: std::sync::Mutex<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(
        registration: ServerRegistration,
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let permits = Arc::new(Semaphore::new(registration.max_concurrent_requests.max(1)));
        Arc::new(Self {
            registration,
            factory,
            credentials,
            transport: RwLock::new(None),
            correlator: Arc::new(RequestCorrelator::new()),
            status: RwLock::new(ConnectionStatus::default()),
            server_info: RwLock::new(None),
            events,
            permits,
            session: std::sync::Mutex::new(CancellationToken::new()),
        })
    }

    pub fn registration(&self) -> &ServerRegistration {
        &self.registration
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.status.read().await.state.clone()
    }

    /// Snapshot of the connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    /// Server info from the handshake, once connected.
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().await.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        {
            let mut status = self.status.write().await;
            if status.state == state {
                return;
            }
            match &state {
                ConnectionState::Error(message) => {
                    status.last_error = Some(message.clone());
                }
                ConnectionState::Reconnecting { attempt } => {
                    status.reconnect_attempts = *attempt;
                }
                ConnectionState::Connected => {
                    status.reconnect_attempts = 0;
                    status.last_error = None;
                }
                _ => {}
            }
            debug!(
                server_id = %self.registration.id,
                from = %status.state,
                to = %state,
                "Connection state change"
            );
            status.state = state.clone();
        }
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    /// Start the connection. Handshake failure is terminal (`Error`)
    /// until the user retries; only an established connection gets the
    /// automatic reconnection policy.
    pub async fn connect(self: &Arc<Self>) -> McpResult<()> {
        match self.state().await {
            ConnectionState::Connecting | ConnectionState::Connected => {
                return Err(McpError::InvalidState(
                    "Connection already active".to_string(),
                ));
            }
            _ => {}
        }

        self.set_state(ConnectionState::Connecting).await;
        let session = CancellationToken::new();
        {
            let mut current = self.session.lock().unwrap_or_else(|e| e.into_inner());
            current.cancel();
            *current = session.clone();
        }

        match self.establish(&session).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected).await;
                info!(server_id = %self.registration.id, "Connected");
                self.clone().spawn_health_loop(session);
                Ok(())
            }
            Err(e) => {
                self.teardown_transport().await;
                self.set_state(ConnectionState::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Create a transport, wire the reader, and run the handshake.
    async fn establish(self: &Arc<Self>, session: &CancellationToken) -> McpResult<()> {
        let token = self.credentials.access_token(&self.registration.id).await?;
        let transport = self.factory.create(&self.registration, token).await?;

        let inbound = transport.subscribe();
        *self.transport.write().await = Some(transport);
        self.clone().spawn_reader(inbound, session.clone());

        let init = tokio::time::timeout(self.registration.handshake_timeout, self.handshake())
            .await
            .map_err(|_| {
                McpError::InitializationFailed("Handshake timed out".to_string())
            })??;
        *self.server_info.write().await = Some(init);
        Ok(())
    }

    async fn handshake(&self) -> McpResult<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result = self
            .dispatch("initialize", Some(params), self.registration.handshake_timeout)
            .await
            .map_err(|e| match e {
                McpError::Timeout => {
                    McpError::InitializationFailed("Handshake timed out".to_string())
                }
                other => McpError::InitializationFailed(other.to_string()),
            })?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::InitializationFailed(format!("Invalid initialize result: {e}")))?;

        let transport = self.current_transport().await?;
        transport
            .send(JsonRpcRequest::notification("notifications/initialized", None))
            .await?;

        Ok(init)
    }

    async fn current_transport(&self) -> McpResult<Arc<dyn Transport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| McpError::InvalidState("No active transport".to_string()))
    }

    async fn teardown_transport(&self) {
        if let Some(transport) = self.transport.write().await.take() {
            let _ = transport.close().await;
        }
    }

    /// One correlated request/response exchange. Timeout cancels the
    /// pending entry; retry policy belongs to the caller.
    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> McpResult<Value> {
        let transport = self.current_transport().await?;
        let id = self.correlator.next_id();
        let receiver = self.correlator.register(id);

        if let Err(e) = transport.send(JsonRpcRequest::new(id, method, params)).await {
            self.correlator.forget(id);
            return Err(e);
        }

        let response = match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(McpError::Cancelled),
            Err(_) => {
                self.correlator.forget(id);
                return Err(McpError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::protocol(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a request to the connected server.
    ///
    /// Queues behind the per-server concurrency cap, retries once after
    /// a token refresh on auth failure, and respects Retry-After on
    /// rate limiting.
    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        if self.state().await != ConnectionState::Connected {
            return Err(McpError::InvalidState(format!(
                "Server {} is not connected",
                self.registration.id
            )));
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| McpError::Cancelled)?;

        let deadline = self.registration.request_timeout;
        match self.dispatch(method, params.clone(), deadline).await {
            Err(McpError::Auth(reason)) => {
                debug!(server_id = %self.registration.id, %reason, "Auth failure, refreshing token");
                let token = self
                    .credentials
                    .refresh_access_token(&self.registration.id)
                    .await?;
                self.current_transport().await?.set_auth_token(token).await;
                self.dispatch(method, params, deadline).await
            }
            Err(McpError::RateLimited { retry_after }) => {
                let delay =
                    retry_after.unwrap_or_else(|| self.registration.backoff.max_delay_for(1));
                debug!(server_id = %self.registration.id, ?delay, "Rate limited, waiting");
                tokio::time::sleep(delay).await;
                self.dispatch(method, params, deadline).await
            }
            other => other,
        }
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("Invalid tools/list result: {e}")))?;
        Ok(parsed.tools)
    }

    /// Invoke a tool by its server-local name.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<ToolCallResult> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.request("tools/call", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("Invalid tools/call result: {e}")))
    }

    /// User-initiated disconnect. Idempotent; cancels all pending
    /// requests and timers for this server.
    pub async fn disconnect(&self) {
        {
            let current = self.session.lock().unwrap_or_else(|e| e.into_inner());
            current.cancel();
        }
        self.teardown_transport().await;
        self.correlator.fail_all(|| McpError::Cancelled);
        *self.server_info.write().await = None;
        self.set_state(ConnectionState::Disconnected).await;
    }

    fn spawn_reader(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<TransportEvent>,
        session: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = session.cancelled() => return,
                    event = inbound.recv() => event,
                };
                match event {
                    Ok(TransportEvent::Message(ServerMessage::Response(response))) => {
                        self.correlator.resolve(response);
                    }
                    Ok(TransportEvent::Message(ServerMessage::Notification(notification))) => {
                        if notification.method == "notifications/tools/list_changed" {
                            let _ = self.events.send(ConnectionEvent::ToolsChanged);
                        } else {
                            let _ = self.events.send(ConnectionEvent::Notification(notification));
                        }
                    }
                    Ok(TransportEvent::Message(ServerMessage::Request(request))) => {
                        debug!(
                            server_id = %self.registration.id,
                            method = %request.method,
                            "Ignoring server-initiated request"
                        );
                    }
                    Ok(TransportEvent::Failed(reason)) => {
                        self.clone().on_transport_error(reason, session).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            server_id = %self.registration.id,
                            skipped,
                            "Inbound event channel lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// React to a lost transport: fail pending requests, then retry
    /// with bounded, jittered backoff.
    async fn on_transport_error(self: Arc<Self>, reason: String, session: CancellationToken) {
        if session.is_cancelled() {
            return;
        }
        if self.state().await != ConnectionState::Connected {
            return;
        }
        warn!(server_id = %self.registration.id, %reason, "Transport lost");

        self.teardown_transport().await;
        self.correlator
            .fail_all(|| McpError::transport(reason.clone()));
        {
            let mut status = self.status.write().await;
            status.last_error = Some(reason.clone());
        }

        self.reconnect_loop(session).await;
    }

    async fn reconnect_loop(self: Arc<Self>, session: CancellationToken) {
        let mut attempt: u32 = 1;
        loop {
            if session.is_cancelled() {
                return;
            }
            self.set_state(ConnectionState::Reconnecting { attempt }).await;

            let delay = self.registration.backoff.delay_for(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = session.cancelled() => return,
            }

            match self.establish(&session).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected).await;
                    info!(server_id = %self.registration.id, attempt, "Reconnected");
                    self.clone().spawn_health_loop(session);
                    return;
                }
                Err(e) => {
                    self.teardown_transport().await;
                    debug!(server_id = %self.registration.id, attempt, error = %e, "Reconnect failed");
                    if !self.registration.backoff.allows(attempt + 1) {
                        self.set_state(ConnectionState::Error(format!(
                            "Reconnection failed after {attempt} attempts: {e}"
                        )))
                        .await;
                        return;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Probe the server while connected; three consecutive failures
    /// count as a transport error.
    fn spawn_health_loop(self: Arc<Self>, session: CancellationToken) {
        tokio::spawn(async move {
            let mut failures: u32 = 0;
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = session.cancelled() => return,
                }
                if self.state().await != ConnectionState::Connected {
                    return;
                }

                match self.dispatch("ping", None, HEALTH_PROBE_TIMEOUT).await {
                    Ok(_) => {
                        failures = 0;
                        self.status.write().await.last_health_check = Some(Instant::now());
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(
                            server_id = %self.registration.id,
                            failures,
                            error = %e,
                            "Health probe failed"
                        );
                        if failures >= HEALTH_MAX_FAILURES {
                            self.clone()
                                .on_transport_error(
                                    format!("Health probes failing: {e}"),
                                    session,
                                )
                                .await;
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, ServerCapabilities, ServerInfo, ToolContent};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory transport that answers requests like a tiny MCP
    /// server. When `handshake_only` is set it answers only the
    /// initialize request and leaves everything else pending.
    struct FakeTransport {
        inbound: broadcast::Sender<TransportEvent>,
        sent: std::sync::Mutex<Vec<JsonRpcRequest>>,
        connected: AtomicBool,
        handshake_only: bool,
        silent: bool,
    }

    impl FakeTransport {
        fn new(handshake_only: bool, silent: bool) -> Arc<Self> {
            let (inbound, _) = broadcast::channel(64);
            Arc::new(Self {
                inbound,
                sent: std::sync::Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                handshake_only,
                silent,
            })
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|frame| frame.method.clone())
                .collect()
        }

        fn fail(&self, reason: &str) {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self
                .inbound
                .send(TransportEvent::Failed(reason.to_string()));
        }

        fn answer(&self, id: u64, method: &str) -> Option<JsonRpcResponse> {
            let result = match method {
                "initialize" => serde_json::to_value(InitializeResult {
                    protocol_version: crate::protocol::PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities::default(),
                    server_info: ServerInfo {
                        name: "fake".to_string(),
                        version: None,
                    },
                })
                .unwrap(),
                _ if self.handshake_only => return None,
                "tools/list" => json!({
                    "tools": [{"name": "echo", "inputSchema": {"type": "object"}}]
                }),
                "tools/call" => json!({
                    "content": [{"type": "text", "text": "hi"}]
                }),
                _ => json!({}),
            };
            Some(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id,
                result: Some(result),
                error: None,
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, frame: JsonRpcRequest) -> McpResult<()> {
            self.sent.lock().unwrap().push(frame.clone());
            if self.silent {
                return Ok(());
            }
            if let Some(id) = frame.id {
                if let Some(response) = self.answer(id, &frame.method) {
                    let _ = self
                        .inbound
                        .send(TransportEvent::Message(ServerMessage::Response(response)));
                }
            }
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.inbound.subscribe()
        }

        async fn close(&self) -> McpResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    /// Factory producing fake transports, optionally failing the first
    /// N creation attempts.
    struct FakeFactory {
        handshake_only: bool,
        silent: bool,
        fail_attempts: AtomicU32,
        created: std::sync::Mutex<Vec<Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handshake_only: false,
                silent: false,
                fail_attempts: AtomicU32::new(0),
                created: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn handshake_only() -> Arc<Self> {
            Arc::new(Self {
                handshake_only: true,
                silent: false,
                fail_attempts: AtomicU32::new(0),
                created: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn silent() -> Arc<Self> {
            Arc::new(Self {
                handshake_only: false,
                silent: true,
                fail_attempts: AtomicU32::new(0),
                created: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn failing(attempts: u32) -> Arc<Self> {
            Arc::new(Self {
                handshake_only: false,
                silent: false,
                fail_attempts: AtomicU32::new(attempts),
                created: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn latest(&self) -> Arc<FakeTransport> {
            self.created.lock().unwrap().last().unwrap().clone()
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            _registration: &ServerRegistration,
            _access_token: Option<String>,
        ) -> McpResult<Arc<dyn Transport>> {
            let remaining = self.fail_attempts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_attempts.store(remaining - 1, Ordering::SeqCst);
                return Err(McpError::transport("Simulated connection failure"));
            }
            let transport = FakeTransport::new(self.handshake_only, self.silent);
            self.created.lock().unwrap().push(transport.clone());
            Ok(transport as Arc<dyn Transport>)
        }
    }

    fn fast_registration() -> ServerRegistration {
        let mut registration = ServerRegistration::http("srv_test", "Test", "http://unused/mcp");
        registration.handshake_timeout = Duration::from_millis(200);
        registration.request_timeout = Duration::from_millis(500);
        registration.backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            factor: 1,
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
        };
        registration
    }

    fn manager(factory: Arc<FakeFactory>) -> Arc<ConnectionManager> {
        ConnectionManager::new(fast_registration(), factory, Arc::new(NoCredentials))
    }

    async fn wait_for_state(
        manager: &Arc<ConnectionManager>,
        target: fn(&ConnectionState) -> bool,
    ) -> ConnectionState {
        for _ in 0..200 {
            let state = manager.state().await;
            if target(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.state().await
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let factory = FakeFactory::new();
        let manager = manager(factory.clone());

        manager.connect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Connected);

        // Handshake order: initialize, then the initialized notice.
        let methods = factory.latest().sent_methods();
        assert_eq!(methods[0], "initialize");
        assert_eq!(methods[1], "notifications/initialized");
        assert_eq!(
            manager.server_info().await.unwrap().server_info.name,
            "fake"
        );
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let factory = FakeFactory::new();
        let manager = manager(factory);
        manager.connect().await.unwrap();

        let result = manager.connect().await;
        assert!(matches!(result, Err(McpError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_terminal_error() {
        let factory = FakeFactory::silent();
        let manager = manager(factory);

        let result = manager.connect().await;
        assert!(matches!(result, Err(McpError::InitializationFailed(_))));
        assert!(matches!(manager.state().await, ConnectionState::Error(_)));

        // No automatic retry from the error state.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(manager.state().await, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_call_tool_roundtrip() {
        let factory = FakeFactory::new();
        let manager = manager(factory);
        manager.connect().await.unwrap();

        let result = manager
            .call_tool("echo", Some(json!({"text": "hi"})))
            .await
            .unwrap();
        assert!(matches!(
            &result.content[0],
            ToolContent::Text { text } if text == "hi"
        ));

        let tools = manager.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn test_request_while_disconnected_rejected() {
        let factory = FakeFactory::new();
        let manager = manager(factory);

        let result = manager.request("tools/list", None).await;
        assert!(matches!(result, Err(McpError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_triggers_reconnect() {
        let factory = FakeFactory::new();
        let manager = manager(factory.clone());
        manager.connect().await.unwrap();

        factory.latest().fail("pipe broke");

        // Wait for a fresh transport to come up and the retry to land.
        for _ in 0..200 {
            if factory.created_count() == 2
                && manager.state().await == ConnectionState::Connected
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(factory.created_count(), 2);
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_bounded_attempts_reach_error() {
        let factory = FakeFactory::new();
        let manager = manager(factory.clone());
        manager.connect().await.unwrap();

        // All further creation attempts fail.
        factory.fail_attempts.store(u32::MAX, Ordering::SeqCst);
        factory.latest().fail("pipe broke");

        let state = wait_for_state(&manager, |s| matches!(s, ConnectionState::Error(_))).await;
        assert!(matches!(state, ConnectionState::Error(_)));
        // One original connect plus max_attempts retries, no more.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(manager.state().await, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending() {
        let factory = FakeFactory::handshake_only();
        let manager = manager(factory);
        manager.connect().await.unwrap();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request("tools/list", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.disconnect().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(McpError::Cancelled)));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        // Idempotent.
        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_backpressure_queues_excess_requests() {
        let factory = FakeFactory::handshake_only();
        let mut registration = fast_registration();
        registration.max_concurrent_requests = 1;
        let manager = ConnectionManager::new(registration, factory, Arc::new(NoCredentials));
        manager.connect().await.unwrap();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request("tools/list", None).await })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request("tools/list", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only one request is in flight; the other waits for a permit
        // instead of being dropped.
        assert_eq!(manager.correlator.in_flight(), 1);

        manager.disconnect().await;
        let _ = first.await;
        let _ = second.await;
    }

    #[tokio::test]
    async fn test_state_changes_published() {
        let factory = FakeFactory::new();
        let manager = manager(factory);
        let mut events = manager.subscribe();

        manager.connect().await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    /// Transport that rejects non-handshake requests with an auth
    /// error until a fresh token is installed.
    struct ExpiredTokenTransport {
        inner: Arc<FakeTransport>,
        authorized: AtomicBool,
        rejections: AtomicU32,
    }

    impl ExpiredTokenTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: FakeTransport::new(false, false),
                authorized: AtomicBool::new(false),
                rejections: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for ExpiredTokenTransport {
        async fn send(&self, frame: JsonRpcRequest) -> McpResult<()> {
            let handshake =
                frame.method == "initialize" || frame.method == "notifications/initialized";
            if !handshake && !self.authorized.load(Ordering::SeqCst) {
                self.rejections.fetch_add(1, Ordering::SeqCst);
                return Err(McpError::auth("Token expired"));
            }
            self.inner.send(frame).await
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.inner.subscribe()
        }

        async fn set_auth_token(&self, _token: String) {
            self.authorized.store(true, Ordering::SeqCst);
        }

        async fn close(&self) -> McpResult<()> {
            self.inner.close().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    struct ExpiredTokenFactory {
        transport: Arc<ExpiredTokenTransport>,
    }

    #[async_trait]
    impl TransportFactory for ExpiredTokenFactory {
        async fn create(
            &self,
            _registration: &ServerRegistration,
            _access_token: Option<String>,
        ) -> McpResult<Arc<dyn Transport>> {
            Ok(self.transport.clone() as Arc<dyn Transport>)
        }
    }

    struct CountingCredentials {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl CredentialProvider for CountingCredentials {
        async fn access_token(&self, _server_id: &str) -> McpResult<Option<String>> {
            Ok(Some("stale".to_string()))
        }

        async fn refresh_access_token(&self, _server_id: &str) -> McpResult<String> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok("fresh".to_string())
        }
    }

    #[tokio::test]
    async fn test_auth_failure_refreshes_once_then_succeeds() {
        let transport = ExpiredTokenTransport::new();
        let factory = Arc::new(ExpiredTokenFactory {
            transport: transport.clone(),
        });
        let credentials = Arc::new(CountingCredentials {
            refreshes: AtomicU32::new(0),
        });
        let manager =
            ConnectionManager::new(fast_registration(), factory, credentials.clone());
        manager.connect().await.unwrap();

        // One visible success, one refresh, one rejection under the hood.
        let tools = manager.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.rejections.load(Ordering::SeqCst), 1);

        // Later requests reuse the fresh token without refreshing again.
        manager.list_tools().await.unwrap();
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_retries_succeed_after_user_retry() {
        let factory = FakeFactory::failing(1);
        let manager = manager(factory);

        assert!(manager.connect().await.is_err());
        assert!(matches!(manager.state().await, ConnectionState::Error(_)));

        // User retry succeeds once the transport can be created.
        manager.connect().await.unwrap();
        assert_eq!(manager.state().await, ConnectionState::Connected);
    }
}
