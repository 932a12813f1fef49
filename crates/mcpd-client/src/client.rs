//! Multi-server client: a registry of per-server connection managers.

use crate::connection::{
    ConnectionManager, ConnectionState, CredentialProvider, ServerRegistration, TransportFactory,
};
use crate::error::{McpError, McpResult};
use crate::protocol::ToolCallResult;
use crate::registry::split_namespaced;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// MCP client managing any number of server connections. Each server
/// keeps its own [`ConnectionManager`]; this type owns the map and the
/// cross-server operations.
pub struct McpClient {
    servers: RwLock<HashMap<String, Arc<ConnectionManager>>>,
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialProvider>,
}

impl McpClient {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            factory,
            credentials,
        }
    }

    /// Register a server and connect to it. The manager stays in the
    /// registry even when the initial connect fails, so the caller can
    /// inspect the error state and retry.
    pub async fn add_server(
        &self,
        registration: ServerRegistration,
    ) -> McpResult<Arc<ConnectionManager>> {
        let id = registration.id.clone();
        let manager = {
            let mut servers = self.servers.write().await;
            if servers.contains_key(&id) {
                return Err(McpError::InvalidState(format!(
                    "Server {id} is already registered"
                )));
            }
            let manager = ConnectionManager::new(
                registration,
                self.factory.clone(),
                self.credentials.clone(),
            );
            servers.insert(id.clone(), manager.clone());
            manager
        };

        info!(server_id = %id, "Connecting to MCP server");
        manager.connect().await?;
        Ok(manager)
    }

    pub async fn get(&self, server_id: &str) -> McpResult<Arc<ConnectionManager>> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))
    }

    /// Connection state of a server, if registered.
    pub async fn server_state(&self, server_id: &str) -> Option<ConnectionState> {
        let manager = self.servers.read().await.get(server_id).cloned()?;
        Some(manager.state().await)
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All servers with their state and last error.
    pub async fn list_servers(&self) -> Vec<(String, ConnectionState, Option<String>)> {
        let servers = self.servers.read().await.clone();
        let mut out = Vec::with_capacity(servers.len());
        for (id, manager) in servers {
            let status = manager.status().await;
            out.push((id, status.state, status.last_error));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Invoke a namespaced tool (`{server}__{tool}`) on its owner.
    pub async fn call_tool(
        &self,
        namespaced: &str,
        arguments: Option<Value>,
    ) -> McpResult<ToolCallResult> {
        let (server_id, tool_name) = split_namespaced(namespaced)
            .ok_or_else(|| McpError::ToolNotFound(namespaced.to_string()))?;
        let manager = self.get(server_id).await?;
        manager.call_tool(tool_name, arguments).await
    }

    /// Disconnect and forget a server. Pending requests are cancelled;
    /// removing an unknown server is a no-op.
    pub async fn remove_server(&self, server_id: &str) {
        let removed = self.servers.write().await.remove(server_id);
        if let Some(manager) = removed {
            manager.disconnect().await;
            info!(server_id, "Removed MCP server");
        }
    }

    /// Disconnect everything. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.servers.write().await.drain().collect();
        for (id, manager) in drained {
            manager.disconnect().await;
            warn!(server_id = %id, "Closed MCP server connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NoCredentials;
    use crate::protocol::{
        InitializeResult, JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo,
        ServerMessage, PROTOCOL_VERSION,
    };
    use crate::transport::{Transport, TransportEvent};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast;

    /// Transport that answers initialize and tools/call inline.
    struct EchoTransport {
        inbound: broadcast::Sender<TransportEvent>,
    }

    impl EchoTransport {
        fn new() -> Arc<Self> {
            let (inbound, _) = broadcast::channel(16);
            Arc::new(Self { inbound })
        }
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send(&self, frame: JsonRpcRequest) -> McpResult<()> {
            let Some(id) = frame.id else { return Ok(()) };
            let result = match frame.method.as_str() {
                "initialize" => serde_json::to_value(InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: ServerCapabilities::default(),
                    server_info: ServerInfo {
                        name: "echo".to_string(),
                        version: None,
                    },
                })
                .unwrap(),
                "tools/call" => json!({"content": [{"type": "text", "text": "hi"}]}),
                _ => json!({}),
            };
            let _ = self
                .inbound
                .send(TransportEvent::Message(ServerMessage::Response(
                    JsonRpcResponse {
                        jsonrpc: "2.0".to_string(),
                        id,
                        result: Some(result),
                        error: None,
                    },
                )));
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
            self.inbound.subscribe()
        }

        async fn close(&self) -> McpResult<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    struct EchoFactory;

    #[async_trait]
    impl TransportFactory for EchoFactory {
        async fn create(
            &self,
            _registration: &ServerRegistration,
            _access_token: Option<String>,
        ) -> McpResult<Arc<dyn Transport>> {
            Ok(EchoTransport::new() as Arc<dyn Transport>)
        }
    }

    fn client() -> McpClient {
        McpClient::new(Arc::new(EchoFactory), Arc::new(NoCredentials))
    }

    fn registration(id: &str) -> ServerRegistration {
        ServerRegistration::http(id, id, "http://unused/mcp")
    }

    #[tokio::test]
    async fn test_add_list_and_call() {
        let client = client();
        client.add_server(registration("srv_a")).await.unwrap();
        client.add_server(registration("srv_b")).await.unwrap();

        assert_eq!(client.server_ids().await, vec!["srv_a", "srv_b"]);
        assert_eq!(
            client.server_state("srv_a").await,
            Some(ConnectionState::Connected)
        );

        let result = client
            .call_tool("srv_b__echo", Some(json!({"text": "hi"})))
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let client = client();
        client.add_server(registration("srv_a")).await.unwrap();
        let result = client.add_server(registration("srv_a")).await;
        assert!(matches!(result, Err(McpError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_remove_disconnects_and_forgets() {
        let client = client();
        let manager = client.add_server(registration("srv_a")).await.unwrap();

        client.remove_server("srv_a").await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(client.server_state("srv_a").await.is_none());

        // No-op for unknown ids.
        client.remove_server("srv_a").await;
    }

    #[tokio::test]
    async fn test_call_unknown_server_or_tool() {
        let client = client();
        let result = client.call_tool("srv_x__echo", None).await;
        assert!(matches!(result, Err(McpError::ServerNotFound(_))));

        let result = client.call_tool("nonamespace", None).await;
        assert!(matches!(result, Err(McpError::ToolNotFound(_))));
    }
}
