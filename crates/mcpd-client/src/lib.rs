//! MCP (Model Context Protocol) client.
//!
//! Speaks JSON-RPC to tool-providing servers over two transports:
//! direct HTTP/SSE, and stdio pipes bridged by the proxy daemon. Each
//! server gets a [`ConnectionManager`] owning its state machine, health
//! probing, and reconnection policy; responses are matched to callers
//! by id through the [`RequestCorrelator`]; discovered tools flow into
//! the function-calling registry via the [`ToolRegistryBridge`].

pub mod backoff;
pub mod client;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use backoff::{BackoffPolicy, RateLimitInfo};
pub use client::McpClient;
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, ConnectionStatus, CredentialProvider,
    DefaultTransportFactory, NoCredentials, ServerRegistration, TransportFactory, TransportKind,
};
pub use correlator::RequestCorrelator;
pub use error::{McpError, McpResult};
pub use protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, McpTool, ServerMessage, ToolCallResult,
    ToolContent, PROTOCOL_VERSION,
};
pub use registry::{
    namespaced_name, split_namespaced, InMemoryToolRegistry, ToolDescriptor, ToolRegistryBridge,
    ToolSink,
};
pub use transport::{
    HttpConfig, HttpTransport, ProxyConfig, ProxyTransport, Transport, TransportEvent,
};
