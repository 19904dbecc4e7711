//! The `ToolExecutor` capability.
//!
//! The turn engine and the dispatch workers see the connection plane
//! through this trait, keeping the dependency one-way and the engine
//! testable against scripted executors.

use async_trait::async_trait;
use serde_json::Value;

use tb_domain::tool::ExposedTool;
use tb_domain::Result;
use tb_servers::protocol::ToolCallResult;
use tb_servers::ConnectionManager;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The aggregate exposed-tool catalog.
    async fn catalog(&self) -> Vec<ExposedTool>;

    /// Resolve an exposed name to `(server, original name)`.
    async fn resolve(&self, exposed_name: &str) -> Option<(String, String)>;

    /// Execute a tool already resolved to its owning server.
    async fn call(
        &self,
        server_name: &str,
        original_name: &str,
        args: Value,
    ) -> Result<ToolCallResult>;
}

#[async_trait]
impl ToolExecutor for ConnectionManager {
    async fn catalog(&self) -> Vec<ExposedTool> {
        self.all_tools().await
    }

    async fn resolve(&self, exposed_name: &str) -> Option<(String, String)> {
        self.resolve_tool(exposed_name).await
    }

    async fn call(
        &self,
        server_name: &str,
        original_name: &str,
        args: Value,
    ) -> Result<ToolCallResult> {
        self.call_on_server(server_name, original_name, args).await
    }
}
