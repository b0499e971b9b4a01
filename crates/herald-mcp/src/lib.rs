//! MCP (Model Context Protocol) tool broker for Herald.
//!
//! Bridges MCP servers into the orchestrator's [`ToolBroker`] seam:
//!
//! ```text
//! agent.yaml [agent.mcp.servers]
//!   → McpServerConfig (command | url, env)
//!   → McpManager::connect_all
//!   → rmcp RunningService (stdio child process or streamable HTTP)
//!   → tools/list → ToolDefinition snapshot for completion requests
//!   → tools/call → extracted text result
//! ```
//!
//! [`ToolBroker`]: herald_runner::broker::ToolBroker

mod error;
mod manager;

pub use error::{McpError, Result};
pub use manager::{McpManager, ToolExecutor};
pub use rmcp::model::CallToolResult;

/// Extracts text from MCP content items.
///
/// Concatenates every `Text` item; non-text content (images, audio, binary
/// resources) is represented by a `[<type>]` placeholder.
pub fn content_to_text(content: &[rmcp::model::Content]) -> String {
    use rmcp::model::RawContent;
    use std::ops::Deref;

    let mut parts: Vec<String> = Vec::with_capacity(content.len());
    for item in content {
        match item.deref() {
            RawContent::Text(text) => parts.push(text.text.clone()),
            RawContent::Image(_) => parts.push("[image]".into()),
            RawContent::Resource(resource) => match &resource.resource {
                rmcp::model::ResourceContents::TextResourceContents { text, .. } => {
                    if text.is_empty() {
                        parts.push("[resource]".into());
                    } else {
                        parts.push(text.clone());
                    }
                }
                _ => parts.push("[resource]".into()),
            },
            RawContent::Audio(_) => parts.push("[audio]".into()),
            RawContent::ResourceLink(link) => {
                parts.push(format!("[resource_link: {}]", link.uri));
            }
        }
    }
    parts.join("\n")
}
