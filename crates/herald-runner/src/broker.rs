//! The tool-broker seam.
//!
//! The orchestrator consumes remotely hosted tools through [`ToolBroker`];
//! `herald-mcp` provides the MCP-backed implementation, and tests substitute
//! scripted executors.

use async_trait::async_trait;

use crate::llm::types::ToolDefinition;

/// Errors surfaced by a tool broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The model requested a tool no server registered. No retry.
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    /// The remote tool invocation failed.
    #[error("tool '{name}' execution failed: {reason}")]
    Execution { name: String, reason: String },
}

/// Summary of one registered tool, used for observability.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Name of the server that provides the tool.
    pub server: String,
}

/// Discovers and invokes remotely hosted tools.
#[async_trait]
pub trait ToolBroker: Send + Sync {
    /// Snapshot of all registered tool definitions, for attachment to a
    /// completion request.
    fn tools(&self) -> Vec<ToolDefinition>;

    /// Tool summaries including origin servers.
    fn tools_info(&self) -> Vec<ToolInfo>;

    /// Executes one tool call and returns the extracted text result.
    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<String, BrokerError>;

    /// Terminates all server sessions.
    async fn close(&self);
}
