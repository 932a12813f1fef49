//! MCP transport implementations.
//!
//! Two concrete transports share one contract: HTTP/SSE for
//! network-reachable servers, and pipe-via-proxy for servers that only
//! speak stdio, reached through the bridging proxy.

use crate::error::McpResult;
use crate::protocol::{JsonRpcRequest, ServerMessage};
use async_trait::async_trait;
use tokio::sync::broadcast;

pub mod http;
pub mod proxy;
mod sse;

pub use http::{HttpConfig, HttpTransport};
pub use proxy::{ProxyConfig, ProxyTransport};
pub(crate) use sse::{SseEvent, SseParser};

/// Inbound activity on a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded protocol message pushed by the server.
    Message(ServerMessage),
    /// The transport failed (stream lost, pipe crashed). The connection
    /// manager reacts with its reconnection policy.
    Failed(String),
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame. Responses arrive on the subscribed stream and are
    /// matched by id, not by call order.
    async fn send(&self, frame: JsonRpcRequest) -> McpResult<()>;

    /// Subscribe to inbound messages and transport failures.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Update the bearer token used for subsequent sends.
    async fn set_auth_token(&self, _token: String) {}

    /// Close the transport.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Bounded set remembering recently seen event ids, so a reconnecting
/// event stream never delivers the same message twice.
#[derive(Debug, Default)]
pub(crate) struct SeenIds {
    order: std::collections::VecDeque<String>,
    set: std::collections::HashSet<String>,
}

/// How many delivered event ids to remember across stream reconnects.
const SEEN_ID_CAPACITY: usize = 1024;

impl SeenIds {
    /// Record an id. Returns false when the id was already delivered.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_ID_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    /// Most recently delivered id, for `Last-Event-ID` resumption.
    pub fn last(&self) -> Option<&str> {
        self.order.back().map(String::as_str)
    }
}
