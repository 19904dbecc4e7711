//! Connection manager — one logical connection per enabled tool server,
//! catalog aggregation, and call routing.
//!
//! Per-server failures are isolated: one server going down never stops
//! the others from serving.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use serde_json::Value;
use tokio::sync::RwLock;

use tb_domain::config::{NamespacingStrategy, ToolServerConfig, TransportConfig};
use tb_domain::tool::{ExposedTool, ToolDescriptor};
use tb_domain::{Error, Result};
use tb_sandbox::{ResourceCaps, SandboxRuntime, SandboxSpec};

use crate::naming::{self, ServerTools};
use crate::protocol::{self, ToolCallResult, ToolsListResult};
use crate::registry::ToolServerRegistry;
use crate::remote::{HttpTransport, SseTransport};
use crate::transport::{LocalStdioTransport, SandboxStdioTransport, ToolTransport};

/// Stdio servers get a fixed per-request deadline; remote transports use
/// their configured `timeoutMs`.
const STDIO_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the health capability check.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One live tool-server connection.
pub struct ServerConnection {
    pub name: String,
    pub config: ToolServerConfig,
    transport: Box<dyn ToolTransport>,
    /// Catalog from the last successful `tools/list`.
    tools: SyncRwLock<Vec<ToolDescriptor>>,
    /// Sandbox carrying this server, when transport is sandbox-stdio.
    sandbox_id: Option<String>,
}

impl ServerConnection {
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Invoke `tools/call` for one tool on this server.
    pub async fn call_tool(&self, original_name: &str, args: Value) -> Result<ToolCallResult> {
        let params = serde_json::json!({
            "name": original_name,
            "arguments": args,
        });
        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(Error::from)?;
        let result = resp
            .into_result()
            .map_err(|e| Error::PermanentExternal(format!("tools/call failed: {e}")))?;
        serde_json::from_value(result)
            .map_err(|e| Error::Integrity(format!("malformed tools/call result: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConnectionManager {
    registry: Arc<ToolServerRegistry>,
    runtime: Arc<dyn SandboxRuntime>,
    /// Name-ordered so catalog aggregation is deterministic.
    connections: RwLock<BTreeMap<String, Arc<ServerConnection>>>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<ToolServerRegistry>, runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            registry,
            runtime,
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Connect to every enabled server. Individual failures are logged
    /// and skipped, never fatal to initialization.
    pub async fn initialize(&self) {
        for (name, _) in self.registry.list_enabled() {
            if let Err(err) = self.connect(&name).await {
                tracing::warn!(server = %name, error = %err, "failed to connect tool server, skipping");
            }
        }
        let connected = self.connections.read().await.len();
        tracing::info!(connected, "connection manager initialized");
    }

    /// Open (or replace) the connection to one server.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let config = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("no such server: {name}")))?;
        if !config.enabled {
            return Err(Error::Conflict(format!("server {name:?} is disabled")));
        }

        // Replace any existing connection first.
        self.disconnect(name).await;

        let (transport, sandbox_id) = self.open_transport(name, &config).await?;

        let tools = match self.handshake(name, transport.as_ref()).await {
            Ok(tools) => tools,
            Err(err) => {
                transport.shutdown().await;
                if let Some(sandbox_id) = &sandbox_id {
                    if let Err(destroy_err) = self.runtime.destroy(sandbox_id).await {
                        tracing::warn!(
                            sandbox_id = %sandbox_id,
                            error = %destroy_err,
                            "failed to destroy sandbox after handshake failure"
                        );
                    }
                }
                return Err(err);
            }
        };

        let descriptors: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|spec| spec.into_descriptor(name))
            .collect();
        tracing::info!(server = %name, tool_count = descriptors.len(), "tool server connected");

        let connection = Arc::new(ServerConnection {
            name: name.to_owned(),
            config,
            transport,
            tools: SyncRwLock::new(descriptors),
            sandbox_id,
        });
        self.connections
            .write()
            .await
            .insert(name.to_owned(), connection);
        Ok(())
    }

    /// Build the transport for one server, creating a sandbox when the
    /// config asks for one.
    async fn open_transport(
        &self,
        name: &str,
        config: &ToolServerConfig,
    ) -> Result<(Box<dyn ToolTransport>, Option<String>)> {
        match &config.transport {
            TransportConfig::SandboxStdio {
                container_image,
                container_env,
                container_memory_mib,
                container_cpu,
            } => {
                let spec = SandboxSpec {
                    image: container_image.clone(),
                    command: None,
                    env: container_env.clone(),
                    caps: ResourceCaps {
                        memory_mib: *container_memory_mib,
                        cpu: *container_cpu,
                        network_enabled: false,
                    },
                };
                let sandbox_id = self.runtime.create(&spec).await?;
                let streams = match self.runtime.attach(&sandbox_id).await {
                    Ok(streams) => streams,
                    Err(err) => {
                        if let Err(destroy_err) = self.runtime.destroy(&sandbox_id).await {
                            tracing::warn!(sandbox_id = %sandbox_id, error = %destroy_err, "failed to destroy unattachable sandbox");
                        }
                        return Err(err);
                    }
                };
                tracing::debug!(server = %name, sandbox_id = %sandbox_id, "sandbox created for tool server");
                Ok((
                    Box::new(SandboxStdioTransport::new(streams, STDIO_REQUEST_TIMEOUT)),
                    Some(sandbox_id),
                ))
            }
            TransportConfig::LocalStdio {
                command,
                args,
                env,
                cwd,
            } => {
                let transport = LocalStdioTransport::spawn(
                    command,
                    args,
                    env,
                    cwd.as_deref(),
                    STDIO_REQUEST_TIMEOUT,
                )
                .map_err(Error::from)?;
                Ok((Box::new(transport), None))
            }
            TransportConfig::Http {
                url,
                headers,
                timeout_ms,
                ..
            } => {
                let transport =
                    HttpTransport::new(url, headers.clone(), Duration::from_millis(*timeout_ms))
                        .map_err(Error::from)?;
                Ok((Box::new(transport), None))
            }
            TransportConfig::Sse {
                url,
                headers,
                timeout_ms,
            } => {
                let transport =
                    SseTransport::new(url, headers.clone(), Duration::from_millis(*timeout_ms))
                        .map_err(Error::from)?;
                Ok((Box::new(transport), None))
            }
        }
    }

    /// `initialize` → `notifications/initialized` → `tools/list`.
    async fn handshake(
        &self,
        name: &str,
        transport: &dyn ToolTransport,
    ) -> Result<Vec<protocol::ToolSpec>> {
        let params = serde_json::to_value(protocol::initialize_params())?;
        let resp = transport
            .send_request("initialize", Some(params))
            .await
            .map_err(Error::from)?;
        resp.into_result()
            .map_err(|e| Error::PermanentExternal(format!("initialize failed: {e}")))?;

        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(Error::from)?;

        let tools_resp = transport
            .send_request("tools/list", None)
            .await
            .map_err(Error::from)?;
        let tools = match tools_resp.into_result() {
            Ok(result) => match serde_json::from_value::<ToolsListResult>(result) {
                Ok(parsed) => parsed.tools,
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "failed to parse tools/list result");
                    Vec::new()
                }
            },
            Err(err) => {
                tracing::warn!(server = %name, error = %err, "tools/list returned error, server has no tools");
                Vec::new()
            }
        };
        Ok(tools)
    }

    /// Close one server's connection, destroying its sandbox if any.
    pub async fn disconnect(&self, name: &str) {
        let connection = self.connections.write().await.remove(name);
        if let Some(connection) = connection {
            connection.transport.shutdown().await;
            if let Some(sandbox_id) = &connection.sandbox_id {
                if let Err(err) = self.runtime.destroy(sandbox_id).await {
                    tracing::warn!(sandbox_id = %sandbox_id, error = %err, "failed to destroy tool server sandbox");
                }
            }
            tracing::info!(server = %name, "tool server disconnected");
        }
    }

    pub async fn reconnect(&self, name: &str) -> Result<()> {
        self.disconnect(name).await;
        self.connect(name).await
    }

    /// Capability check: `tools/list` within a 5 s deadline. Refreshes
    /// the cached catalog on success.
    pub async fn check_health(&self, name: &str) -> bool {
        let connection = match self.connections.read().await.get(name).cloned() {
            Some(connection) => connection,
            None => return false,
        };
        if !connection.is_alive() {
            return false;
        }

        let probe = tokio::time::timeout(
            HEALTH_PROBE_TIMEOUT,
            connection.transport.send_request("tools/list", None),
        )
        .await;

        match probe {
            Ok(Ok(resp)) if !resp.is_error() => {
                if let Ok(result) = resp.into_result() {
                    if let Ok(parsed) = serde_json::from_value::<ToolsListResult>(result) {
                        *connection.tools.write() = parsed
                            .tools
                            .into_iter()
                            .map(|spec| spec.into_descriptor(name))
                            .collect();
                    }
                }
                true
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => false,
        }
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.connections.read().await.contains_key(name)
    }

    pub async fn connected_names(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Catalog snapshot used for both name resolution and routing.
    async fn server_tools(&self) -> Vec<ServerTools> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.is_alive())
            .map(|connection| ServerTools {
                server_name: connection.name.clone(),
                tool_prefix: connection.config.tool_prefix.clone(),
                tools: connection.tools(),
            })
            .collect()
    }

    /// The aggregate catalog under the configured namespacing strategy.
    pub async fn all_tools(&self) -> Vec<ExposedTool> {
        let strategy: NamespacingStrategy = self.registry.settings().tool_namespacing;
        naming::resolve_names(strategy, &self.server_tools().await)
    }

    /// Resolve an exposed name to `(server, original name)` without
    /// executing it.
    pub async fn resolve_tool(&self, exposed_name: &str) -> Option<(String, String)> {
        let servers = self.server_tools().await;
        naming::route(&servers, exposed_name)
            .map(|(server, original)| (server.to_owned(), original))
    }

    /// Execute an exposed tool name, routing it to its owning server.
    pub async fn execute_tool(&self, exposed_name: &str, args: Value) -> Result<ToolCallResult> {
        let servers = self.server_tools().await;
        let (server_name, original_name) = naming::route(&servers, exposed_name)
            .ok_or_else(|| Error::NotFound(format!("no server owns tool {exposed_name:?}")))?;
        let server_name = server_name.to_owned();
        self.call_on_server(&server_name, &original_name, args).await
    }

    /// Execute a tool already resolved to `(server, original name)`.
    /// The dispatch-plane workers call this directly.
    pub async fn call_on_server(
        &self,
        server_name: &str,
        original_name: &str,
        args: Value,
    ) -> Result<ToolCallResult> {
        let connection = self
            .connections
            .read()
            .await
            .get(server_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("server {server_name:?} is not connected")))?;
        connection.call_tool(original_name, args).await
    }

    /// Close every connection.
    pub async fn cleanup(&self) {
        let names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tb_sandbox::InProcessRuntime;

    /// Scripted in-memory transport: answers the handshake and echoes
    /// tool calls.
    struct FakeTransport {
        tools: Vec<&'static str>,
        calls: Mutex<Vec<(String, Value)>>,
        alive: std::sync::atomic::AtomicBool,
    }

    impl FakeTransport {
        fn new(tools: Vec<&'static str>) -> Self {
            Self {
                tools,
                calls: Mutex::new(Vec::new()),
                alive: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl ToolTransport for FakeTransport {
        async fn send_request(
            &self,
            method: &str,
            params: Option<Value>,
        ) -> std::result::Result<crate::protocol::JsonRpcResponse, TransportError> {
            let result = match method {
                "initialize" => serde_json::json!({ "capabilities": {} }),
                "tools/list" => serde_json::json!({
                    "tools": self.tools.iter().map(|name| serde_json::json!({ "name": name })).collect::<Vec<_>>()
                }),
                "tools/call" => {
                    let params = params.unwrap_or_default();
                    let name = params["name"].as_str().unwrap_or_default().to_owned();
                    self.calls.lock().push((name.clone(), params["arguments"].clone()));
                    serde_json::json!({
                        "content": [{ "type": "text", "text": format!("ran {name}") }],
                        "isError": false
                    })
                }
                other => serde_json::json!({ "echo": other }),
            };
            Ok(crate::protocol::JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: 1,
                result: Some(result),
                error: None,
            })
        }

        async fn send_notification(&self, _method: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn manager_with_registry(dir: &tempfile::TempDir) -> ConnectionManager {
        let registry = Arc::new(
            ToolServerRegistry::load(dir.path().join("tool-servers.json")).unwrap(),
        );
        ConnectionManager::new(registry, Arc::new(InProcessRuntime::new()))
    }

    async fn install_fake(
        manager: &ConnectionManager,
        name: &str,
        prefix: Option<&str>,
        tools: Vec<&'static str>,
    ) {
        let transport = FakeTransport::new(tools.clone());
        let descriptors = tools
            .iter()
            .map(|t| ToolDescriptor {
                server_name: name.into(),
                original_name: (*t).into(),
                description: String::new(),
                parameters: tb_domain::tool::empty_object_schema(),
            })
            .collect();
        let connection = Arc::new(ServerConnection {
            name: name.into(),
            config: ToolServerConfig {
                transport: TransportConfig::Http {
                    url: "https://unused.example/rpc".into(),
                    headers: HashMap::new(),
                    health_check_endpoint: None,
                    timeout_ms: 30_000,
                },
                enabled: true,
                description: String::new(),
                tool_prefix: prefix.map(Into::into),
            },
            transport: Box::new(transport),
            tools: SyncRwLock::new(descriptors),
            sandbox_id: None,
        });
        manager
            .connections
            .write()
            .await
            .insert(name.into(), connection);
    }

    #[tokio::test]
    async fn aggregate_catalog_disambiguates_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "fs", None, vec!["read"]).await;
        install_fake(&manager, "net", None, vec!["read"]).await;

        let catalog = manager.all_tools().await;
        let names: Vec<&str> = catalog.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["fs_read", "net_read"]);
    }

    #[tokio::test]
    async fn execute_tool_routes_prefixed_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "fs", None, vec!["read"]).await;
        install_fake(&manager, "net", None, vec!["read"]).await;

        let result = manager
            .execute_tool("fs_read", serde_json::json!({ "path": "/a" }))
            .await
            .unwrap();
        assert_eq!(result.content[0].text, "ran read");
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "fs", None, vec!["read"]).await;

        let err = manager
            .execute_tool("missing_tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn single_server_auto_exposes_raw_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "fs", None, vec!["read", "write"]).await;

        let catalog = manager.all_tools().await;
        let names: Vec<&str> = catalog.iter().map(|t| t.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["read", "write"]);

        let result = manager
            .execute_tool("write", serde_json::json!({}))
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn check_health_probes_and_refreshes_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "fs", None, vec!["read"]).await;

        assert!(manager.check_health("fs").await);
        assert!(!manager.check_health("ghost").await);
    }

    #[tokio::test]
    async fn disconnect_removes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "fs", None, vec!["read"]).await;

        assert!(manager.is_connected("fs").await);
        manager.disconnect("fs").await;
        assert!(!manager.is_connected("fs").await);
        assert!(manager.all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn connect_unknown_server_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        let err = manager.connect("ghost").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn cleanup_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_registry(&dir);
        install_fake(&manager, "a", None, vec!["x"]).await;
        install_fake(&manager, "b", None, vec!["y"]).await;

        manager.cleanup().await;
        assert!(manager.connected_names().await.is_empty());
    }
}
