//! MCP broker error types.

/// Errors from MCP server connections and tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The stdio server process could not be spawned.
    #[error("failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    /// Initialization, discovery, or RPC failed.
    #[error("MCP protocol error for '{server}': {message}")]
    Protocol { server: String, message: String },

    /// The server definition is unusable (e.g. empty command line).
    #[error("invalid MCP server '{name}': {reason}")]
    InvalidServer { name: String, reason: String },

    /// No connected server provides the requested tool. No retry.
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    /// The arguments cannot be forwarded to the server.
    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The server executed the tool and reported a failure.
    #[error("tool '{tool}' on '{server}' returned error: {message}")]
    ToolError {
        server: String,
        tool: String,
        message: String,
    },
}

/// Convenience alias used throughout the MCP crate.
pub type Result<T> = std::result::Result<T, McpError>;
