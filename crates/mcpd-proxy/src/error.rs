//! Proxy error types.

use thiserror::Error;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors from the bridging proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No server registered under this id.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// A running server already holds this id.
    #[error("Server already registered: {0}")]
    AlreadyRegistered(String),

    /// The child process could not be started.
    #[error("Failed to spawn server process: {0}")]
    Spawn(String),

    /// The child is registered but no longer running. Crashed children
    /// are never restarted here; reconnection policy lives with the
    /// connection manager.
    #[error("Server process not running: {0}")]
    NotRunning(String),

    /// A frame could not be written to the child.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid frame or request body.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
