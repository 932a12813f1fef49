//! MCP error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Tool not found.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Network or pipe failure. Triggers the reconnection policy.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or unknown method. The request fails, the
    /// connection stays up.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response within the deadline. The request fails; retry policy
    /// belongs to the caller.
    #[error("Request timed out")]
    Timeout,

    /// The request was cancelled (user disconnect).
    #[error("Request cancelled")]
    Cancelled,

    /// 401/403 from the server after the single refresh attempt.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 429 from the server. Honored via a retry-after-aware backoff.
    #[error("Rate limited")]
    RateLimited {
        /// Server-provided retry delay, if any.
        retry_after: Option<Duration>,
    },

    /// Child process exited unexpectedly. Surfaced to the connection
    /// manager as a transport-class error.
    #[error("Server process crashed: {0}")]
    ProcessCrash(String),

    /// Server handshake failed.
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Operation not valid in the current connection state.
    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Whether this error should trigger the reconnection policy.
    ///
    /// Protocol, timeout, and auth errors fail the request without
    /// tearing the connection down.
    pub fn is_transport_class(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ProcessCrash(_) | Self::Io(_) => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}
