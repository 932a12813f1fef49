//! Tool registry bridge.
//!
//! Converts server-advertised tool schemas into namespaced descriptors
//! and keeps the external function-calling registry in sync with
//! connection lifecycle: publish on connect, republish on catalog
//! change, remove on disconnect.

use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{McpError, McpResult};
use crate::protocol::McpTool;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Separator between the server namespace and the tool's own name.
const NAMESPACE_SEPARATOR: &str = "__";

/// A normalized, namespaced tool definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Namespaced name, unique across all servers.
    pub name: String,
    /// Originating server.
    pub server_id: String,
    /// The server-local tool name, as used in `tools/call`.
    pub tool_name: String,
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    pub input_schema: Value,
}

/// Compose the namespaced tool name for a server-local tool.
pub fn namespaced_name(server_id: &str, tool_name: &str) -> String {
    format!("{server_id}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Split a namespaced name back into (server id, tool name).
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

/// The external function-calling registry this bridge feeds.
pub trait ToolSink: Send + Sync {
    fn register_tool(&self, descriptor: ToolDescriptor);
    fn unregister_tools_for_server(&self, server_id: &str);
}

/// In-memory tool registry.
///
/// Mutated only by the bridge (single writer); readers get snapshot
/// copies, never live references.
#[derive(Default)]
pub struct InMemoryToolRegistry {
    tools: Mutex<HashMap<String, ToolDescriptor>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all registered tools.
    pub fn snapshot(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.values().cloned().collect()
    }

    /// Look up one tool by its namespaced name.
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.get(name).cloned()
    }

    /// Snapshot of the tools originating from one server.
    pub fn tools_for_server(&self, server_id: &str) -> Vec<ToolDescriptor> {
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools
            .values()
            .filter(|descriptor| descriptor.server_id == server_id)
            .cloned()
            .collect()
    }
}

impl ToolSink for InMemoryToolRegistry {
    fn register_tool(&self, descriptor: ToolDescriptor) {
        let mut tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tools.get(&descriptor.name) {
            if existing.server_id != descriptor.server_id {
                warn!(
                    name = %descriptor.name,
                    owner = %existing.server_id,
                    claimant = %descriptor.server_id,
                    "Refusing to overwrite tool owned by another server"
                );
                return;
            }
        }
        tools.insert(descriptor.name.clone(), descriptor);
    }

    fn unregister_tools_for_server(&self, server_id: &str) {
        let mut tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        tools.retain(|_, descriptor| descriptor.server_id != server_id);
    }
}

/// Bridges one or more server connections into a tool sink.
pub struct ToolRegistryBridge {
    sink: Arc<dyn ToolSink>,
}

impl ToolRegistryBridge {
    pub fn new(sink: Arc<dyn ToolSink>) -> Arc<Self> {
        Arc::new(Self { sink })
    }

    /// Validate, namespace, and publish a server's tool catalog,
    /// replacing whatever that server published before. Invalid
    /// entries are skipped with a log line, not fatal.
    pub fn publish(&self, server_id: &str, tools: Vec<McpTool>) -> usize {
        self.sink.unregister_tools_for_server(server_id);

        let mut published = 0;
        for tool in tools {
            if tool.name.trim().is_empty() {
                warn!(server_id, "Skipping tool with empty name");
                continue;
            }
            let input_schema = match tool.input_schema {
                Some(schema) if schema.is_object() => schema,
                Some(_) => {
                    warn!(server_id, tool = %tool.name, "Skipping tool with malformed schema");
                    continue;
                }
                None => json!({"type": "object", "properties": {}}),
            };

            self.sink.register_tool(ToolDescriptor {
                name: namespaced_name(server_id, &tool.name),
                server_id: server_id.to_string(),
                tool_name: tool.name,
                description: tool.description,
                input_schema,
            });
            published += 1;
        }
        info!(server_id, published, "Published tool catalog");
        published
    }

    /// Remove every tool originating from a server.
    pub fn remove(&self, server_id: &str) {
        self.sink.unregister_tools_for_server(server_id);
        debug!(server_id, "Removed tools");
    }

    /// Fetch and publish the connected server's catalog.
    pub async fn sync(&self, manager: &ConnectionManager) -> McpResult<usize> {
        let tools = manager.list_tools().await?;
        Ok(self.publish(&manager.registration().id, tools))
    }

    /// Follow a connection's lifecycle: sync the catalog when it
    /// connects or announces a change, remove it when the connection
    /// goes away. Runs until the connection manager is dropped.
    pub fn watch(self: &Arc<Self>, manager: Arc<ConnectionManager>) {
        let bridge = self.clone();
        let mut events = manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::StateChanged(ConnectionState::Connected))
                    | Ok(ConnectionEvent::ToolsChanged) => {
                        if let Err(e) = bridge.sync(&manager).await {
                            warn!(
                                server_id = %manager.registration().id,
                                error = %e,
                                "Tool catalog sync failed"
                            );
                        }
                    }
                    Ok(ConnectionEvent::StateChanged(
                        ConnectionState::Disconnected
                        | ConnectionState::Reconnecting { .. }
                        | ConnectionState::Error(_),
                    )) => {
                        bridge.remove(&manager.registration().id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed transitions; resync from current state.
                        if manager.state().await == ConnectionState::Connected {
                            let _ = bridge.sync(&manager).await;
                        } else {
                            bridge.remove(&manager.registration().id);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Route a namespaced tool invocation to its owning connection.
    pub async fn call(
        &self,
        managers: &HashMap<String, Arc<ConnectionManager>>,
        namespaced: &str,
        arguments: Option<Value>,
    ) -> McpResult<crate::protocol::ToolCallResult> {
        let (server_id, tool_name) = split_namespaced(namespaced)
            .ok_or_else(|| McpError::ToolNotFound(namespaced.to_string()))?;
        let manager = managers
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()))?;
        manager.call_tool(tool_name, arguments).await
    }
}
