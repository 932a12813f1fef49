//! Child process lifecycle for bridged stdio servers.
//!
//! Each registered server gets a [`ServerProcess`] that owns the child,
//! pumps its stdout/stderr into a broadcast channel as sequenced
//! [`ProxyEvent`]s, and watches for exit. A bounded replay buffer keeps
//! recent events so an SSE consumer can resume after a dropped stream.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpd_util::Identifier;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};

/// Environment variable the child reads its OAuth access token from.
pub const ACCESS_TOKEN_ENV: &str = "MCP_ACCESS_TOKEN";

/// Events kept per server for `Last-Event-ID` replay.
const REPLAY_CAPACITY: usize = 256;

/// Broadcast channel depth for live event fan-out.
const EVENT_CAPACITY: usize = 256;

/// How long a token-refresh restart waits for the old child to die.
const RESTART_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a stdio server is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Capabilities the server declares at registration time.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Injected into the child as `MCP_ACCESS_TOKEN`, never logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl SpawnSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            capabilities: Vec::new(),
            access_token: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Category of a sequenced event on a server's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyEventKind {
    Started,
    Message,
    Stderr,
    Crashed,
    Stopped,
}

impl ProxyEventKind {
    /// Wire name, used as the SSE event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Message => "message",
            Self::Stderr => "stderr",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }
}

/// One sequenced event from a bridged child. `seq` is strictly
/// increasing per server and doubles as the SSE event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEvent {
    pub seq: u64,
    pub kind: ProxyEventKind,
    pub payload: String,
}

/// A bridged child process and its event stream.
///
/// The event channel and sequence counter outlive any single child so
/// that a token-refresh restart looks like an uninterrupted stream to
/// subscribers.
pub struct ServerProcess {
    id: String,
    spec: RwLock<SpawnSpec>,
    stdin: Mutex<Option<ChildStdin>>,
    stop: Mutex<CancellationToken>,
    events: broadcast::Sender<ProxyEvent>,
    replay: Mutex<VecDeque<ProxyEvent>>,
    seq: AtomicU64,
    running: AtomicBool,
    restarting: AtomicBool,
}

impl ServerProcess {
    fn new(id: String, spec: SpawnSpec) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            id,
            spec: RwLock::new(spec),
            stdin: Mutex::new(None),
            stop: Mutex::new(CancellationToken::new()),
            events,
            replay: Mutex::new(VecDeque::with_capacity(REPLAY_CAPACITY)),
            seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn command(&self) -> String {
        self.spec.read().await.command.clone()
    }

    pub async fn capabilities(&self) -> Vec<String> {
        self.spec.read().await.capabilities.clone()
    }

    pub async fn has_token(&self) -> bool {
        self.spec.read().await.access_token.is_some()
    }

    /// Subscribe to live events. Pair with [`replay_after`] to resume
    /// without a gap.
    ///
    /// [`replay_after`]: Self::replay_after
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Buffered events with `seq` greater than `last_seq`. A fresh
    /// consumer passes `None` and receives the whole backlog, starting
    /// with the `started` event.
    pub async fn replay_after(&self, last_seq: Option<u64>) -> Vec<ProxyEvent> {
        let replay = self.replay.lock().await;
        match last_seq {
            Some(after) => replay.iter().filter(|e| e.seq > after).cloned().collect(),
            None => replay.iter().cloned().collect(),
        }
    }

    async fn emit(&self, kind: ProxyEventKind, payload: String) {
        let event = ProxyEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            kind,
            payload,
        };
        let mut replay = self.replay.lock().await;
        if replay.len() >= REPLAY_CAPACITY {
            replay.pop_front();
        }
        replay.push_back(event.clone());
        drop(replay);
        let _ = self.events.send(event);
    }

    /// Spawn the child per the current spec and wire up the IO pumps.
    async fn start(self: &Arc<Self>) -> ProxyResult<()> {
        let spec = self.spec.read().await.clone();

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &spec.access_token {
            cmd.env(ACCESS_TOKEN_ENV, token);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProxyError::Spawn(format!("{}: {e}", spec.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Spawn("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Spawn("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProxyError::Spawn("child stderr unavailable".to_string()))?;

        let stop = CancellationToken::new();
        *self.stop.lock().await = stop.clone();
        *self.stdin.lock().await = Some(stdin);
        self.running.store(true, Ordering::SeqCst);

        info!(server_id = %self.id, command = %spec.command, "spawned stdio server");
        self.emit(ProxyEventKind::Started, spec.command.clone()).await;

        // Line-delimited JSON-RPC frames on stdout become `message` events.
        let proc = self.clone();
        let out_stop = stop.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = out_stop.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                proc.emit(ProxyEventKind::Message, line.to_string()).await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(server_id = %proc.id, error = %e, "stdout read error");
                            break;
                        }
                    },
                }
            }
        });

        let proc = self.clone();
        let err_stop = stop.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    _ = err_stop.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                proc.emit(ProxyEventKind::Stderr, line).await;
                            }
                        }
                        _ => break,
                    },
                }
            }
        });

        // Watch for exit. A stop() cancels the token and we kill the
        // child; anything else is the child dying on its own.
        let proc = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop.cancelled() => None,
            };
            if outcome.is_none() {
                if let Err(e) = child.kill().await {
                    debug!(server_id = %proc.id, error = %e, "kill failed");
                }
            }

            proc.running.store(false, Ordering::SeqCst);
            proc.stdin.lock().await.take();

            // A token-refresh restart replaces the child without
            // surfacing a lifecycle event to subscribers.
            if proc.restarting.load(Ordering::SeqCst) {
                debug!(server_id = %proc.id, "child replaced for restart");
                return;
            }

            match outcome {
                None => {
                    info!(server_id = %proc.id, "stdio server stopped");
                    proc.emit(ProxyEventKind::Stopped, "terminated".to_string()).await;
                }
                Some(Ok(status)) if status.success() => {
                    info!(server_id = %proc.id, "stdio server exited cleanly");
                    proc.emit(ProxyEventKind::Stopped, "exited".to_string()).await;
                }
                Some(Ok(status)) => {
                    let detail = match status.code() {
                        Some(code) => format!("exit status {code}"),
                        None => "killed by signal".to_string(),
                    };
                    warn!(server_id = %proc.id, %detail, "stdio server crashed");
                    proc.emit(ProxyEventKind::Crashed, detail).await;
                }
                Some(Err(e)) => {
                    warn!(server_id = %proc.id, error = %e, "wait on stdio server failed");
                    proc.emit(ProxyEventKind::Crashed, format!("wait failed: {e}")).await;
                }
            }
        });

        Ok(())
    }

    /// Write one JSON-RPC frame to the child's stdin.
    pub async fn send(&self, frame: &str) -> ProxyResult<()> {
        if !self.is_running() {
            return Err(ProxyError::NotRunning(self.id.clone()));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ProxyError::NotRunning(self.id.clone()))?;
        stdin.write_all(frame.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Terminate the child. Subscribers see a `stopped` event; crashed
    /// or stopped children are never respawned here.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.stop.lock().await.cancel();
    }

    /// Replace the stored access token and relaunch the child with the
    /// new environment. The old child's exit is suppressed so the event
    /// stream shows no false crash.
    pub async fn restart_with_token(self: &Arc<Self>, token: Option<String>) -> ProxyResult<()> {
        self.spec.write().await.access_token = token;

        if self.is_running() {
            self.restarting.store(true, Ordering::SeqCst);
            self.stop.lock().await.cancel();

            let deadline = tokio::time::Instant::now() + RESTART_DRAIN_TIMEOUT;
            while self.is_running() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.restarting.store(false, Ordering::SeqCst);
            if self.is_running() {
                return Err(ProxyError::Spawn(format!(
                    "old child for {} did not exit",
                    self.id
                )));
            }
        }

        self.start().await
    }
}

/// Summary row for the server listing endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub command: String,
    pub capabilities: Vec<String>,
    pub running: bool,
}

/// All bridged servers known to this proxy, keyed by id.
#[derive(Default)]
pub struct ProcessTable {
    servers: RwLock<HashMap<String, Arc<ServerProcess>>>,
}

impl ProcessTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register and launch a server. A missing id gets a generated one.
    /// Registering over a live server is refused; a dead entry with the
    /// same id is replaced.
    pub async fn spawn(
        &self,
        id: Option<String>,
        spec: SpawnSpec,
    ) -> ProxyResult<Arc<ServerProcess>> {
        let id = id.unwrap_or_else(Identifier::server);
        let mut servers = self.servers.write().await;
        if let Some(existing) = servers.get(&id) {
            if existing.is_running() {
                return Err(ProxyError::AlreadyRegistered(id));
            }
        }
        let process = ServerProcess::new(id.clone(), spec);
        process.start().await?;
        servers.insert(id, process.clone());
        Ok(process)
    }

    pub async fn get(&self, id: &str) -> ProxyResult<Arc<ServerProcess>> {
        self.servers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::ServerNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<ServerSummary> {
        let servers = self.servers.read().await;
        let mut out = Vec::with_capacity(servers.len());
        for process in servers.values() {
            out.push(ServerSummary {
                id: process.id().to_string(),
                command: process.command().await,
                capabilities: process.capabilities().await,
                running: process.is_running(),
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn running_count(&self) -> usize {
        self.servers
            .read()
            .await
            .values()
            .filter(|p| p.is_running())
            .count()
    }

    /// Stop and forget a server.
    pub async fn remove(&self, id: &str) -> ProxyResult<()> {
        let process = self
            .servers
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ProxyError::ServerNotFound(id.to_string()))?;
        process.stop().await;
        Ok(())
    }

    /// Stop every child. Used on proxy shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.servers.write().await.drain().collect();
        for (_, process) in drained {
            process.stop().await;
        }
    }
}
