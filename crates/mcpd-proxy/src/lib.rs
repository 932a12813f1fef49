//! Bridging proxy daemon.
//!
//! Many MCP servers only speak JSON-RPC over stdio. The proxy adopts
//! them as child processes and exposes each one over HTTP: frames go in
//! through a send endpoint and come back out on a per-server SSE event
//! stream, so any HTTP-capable client can use a stdio-only server.

pub mod error;
pub mod process;
pub mod routes;
pub mod state;

pub use error::{ProxyError, ProxyResult};
pub use process::{
    ProcessTable, ProxyEvent, ProxyEventKind, ServerProcess, ServerSummary, SpawnSpec,
    ACCESS_TOKEN_ENV,
};
pub use routes::router;
pub use state::{ProxyConfig, ProxyState, DEFAULT_BIND};

use tracing::info;

/// Run the proxy until `shutdown` resolves, then reap every child.
pub async fn serve(
    config: ProxyConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let state = ProxyState::new(config.clone());
    let processes = state.processes.clone();

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!(addr = %listener.local_addr()?, "mcpd proxy listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    processes.shutdown().await;
    Ok(())
}
