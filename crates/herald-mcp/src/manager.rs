//! MCP connection manager and tool broker.
//!
//! Connects to configured MCP servers (stdio child process or
//! streamable-HTTP URL), discovers their tools, and routes tool calls to
//! the origin server. Implements [`ToolBroker`] so the orchestrator stays
//! independent of the protocol.
//!
//! Tool names are registered as the servers report them; when two servers
//! expose the same name, the most recently discovered definition wins and
//! the overwrite is logged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use herald_config::McpServerConfig;
use herald_runner::broker::{BrokerError, ToolBroker, ToolInfo};
use herald_runner::llm::types::ToolDefinition;

use crate::content_to_text;
use crate::error::{McpError, Result};

/// Test seam: replaces the remote round trip of [`McpManager::call`].
pub type ToolExecutor =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<String> + Send + Sync>;

struct RegisteredTool {
    definition: ToolDefinition,
    server: String,
}

/// Manages MCP server sessions and tool registration.
#[derive(Default)]
pub struct McpManager {
    services: tokio::sync::RwLock<HashMap<String, RunningService<RoleClient, ()>>>,
    tools: RwLock<HashMap<String, RegisteredTool>>,
    executor: RwLock<Option<ToolExecutor>>,
}

impl McpManager {
    /// Creates a manager with no connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to every configured server and discovers its tools. A
    /// server that fails to connect is logged and skipped so one dead
    /// server cannot take the agent down.
    pub async fn connect_all(&self, servers: &[McpServerConfig]) -> usize {
        let mut connected = 0;
        for server in servers {
            match self.connect(server).await {
                Ok(count) => {
                    connected += 1;
                    info!(server = %server.name, tools = count, "connected to MCP server");
                }
                Err(e) => {
                    warn!(server = %server.name, error = %e, "failed to connect MCP server, skipping");
                }
            }
        }
        connected
    }

    /// Connects to a single server and registers its tools. Returns the
    /// number of tools discovered.
    pub async fn connect(&self, server: &McpServerConfig) -> Result<usize> {
        let service = if let Some(url) = &server.url {
            info!(server = %server.name, url = %url, "connecting to MCP server via http");
            let transport = StreamableHttpClientTransport::from_uri(url.as_str());
            ().serve(transport).await.map_err(|e| McpError::Protocol {
                server: server.name.clone(),
                message: format!("initialization failed: {e}"),
            })?
        } else {
            let program = server
                .command
                .first()
                .ok_or_else(|| McpError::InvalidServer {
                    name: server.name.clone(),
                    reason: "command is empty".to_owned(),
                })?;
            info!(server = %server.name, command = %program, "connecting to MCP server via stdio");

            let mut cmd = Command::new(program);
            cmd.args(&server.command[1..]);
            for (key, value) in &server.env {
                cmd.env(key, value);
            }

            let transport = TokioChildProcess::new(cmd).map_err(|e| McpError::SpawnFailed {
                name: server.name.clone(),
                source: e,
            })?;
            ().serve(transport).await.map_err(|e| McpError::Protocol {
                server: server.name.clone(),
                message: format!("initialization failed: {e}"),
            })?
        };

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| McpError::Protocol {
                server: server.name.clone(),
                message: format!("tools/list failed: {e}"),
            })?;

        let count = tools.len();
        for tool in tools {
            let definition = ToolDefinition {
                name: tool.name.to_string(),
                description: tool
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_owned(),
                parameters: serde_json::Value::Object((*tool.input_schema).clone()),
            };
            self.register_tool(&server.name, definition);
        }

        self.services
            .write()
            .await
            .insert(server.name.clone(), service);

        Ok(count)
    }

    /// Registers one tool under its origin server. Also the test seam for
    /// driving the broker without live servers.
    pub fn register_tool(&self, server: &str, definition: ToolDefinition) {
        let mut tools = self.tools.write().expect("tool map lock poisoned");
        if let Some(existing) = tools.get(&definition.name) {
            debug!(
                tool = %definition.name,
                previous = %existing.server,
                server = %server,
                "tool name collision; keeping most recent registration"
            );
        } else {
            debug!(tool = %definition.name, server = %server, "discovered tool");
        }
        tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                server: server.to_owned(),
            },
        );
    }

    /// Overrides the remote round trip, for tests.
    pub fn set_tool_executor(&self, executor: ToolExecutor) {
        *self.executor.write().expect("executor lock poisoned") = Some(executor);
    }

    /// The server that provides `tool`, if registered.
    pub fn server_for_tool(&self, tool: &str) -> Option<String> {
        self.tools
            .read()
            .expect("tool map lock poisoned")
            .get(tool)
            .map(|registered| registered.server.clone())
    }

    async fn call_impl(&self, name: &str, arguments: &serde_json::Value) -> Result<String> {
        let executor = self.executor.read().expect("executor lock poisoned").clone();

        let server = self
            .server_for_tool(name)
            .ok_or_else(|| McpError::UnknownTool {
                tool: name.to_owned(),
            })?;

        if let Some(executor) = executor {
            return executor(name, arguments);
        }

        let args = match arguments {
            serde_json::Value::Object(map) => Some(map.clone()),
            serde_json::Value::Null => None,
            other => {
                return Err(McpError::InvalidArguments {
                    tool: name.to_owned(),
                    reason: format!("expected a JSON object, got: {other}"),
                });
            }
        };

        let services = self.services.read().await;
        let service = services.get(&server).ok_or_else(|| McpError::Protocol {
            server: server.clone(),
            message: "no open session".to_owned(),
        })?;

        let result = service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_owned().into(),
                arguments: args,
                task: None,
            })
            .await
            .map_err(|e| McpError::Protocol {
                server: server.clone(),
                message: format!("tools/call failed: {e}"),
            })?;

        let text = content_to_text(&result.content);
        if result.is_error.unwrap_or(false) {
            return Err(McpError::ToolError {
                server,
                tool: name.to_owned(),
                message: text,
            });
        }

        Ok(text)
    }

    /// Terminates every open session.
    pub async fn close(&self) {
        let mut services = self.services.write().await;
        for (name, service) in services.drain() {
            if let Err(e) = service.cancel().await {
                warn!(server = %name, error = %e, "error during MCP session shutdown");
            }
        }
        self.tools
            .write()
            .expect("tool map lock poisoned")
            .clear();
    }
}

#[async_trait]
impl ToolBroker for McpManager {
    fn tools(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .expect("tool map lock poisoned")
            .values()
            .map(|registered| registered.definition.clone())
            .collect()
    }

    fn tools_info(&self) -> Vec<ToolInfo> {
        self.tools
            .read()
            .expect("tool map lock poisoned")
            .values()
            .map(|registered| ToolInfo {
                name: registered.definition.name.clone(),
                description: registered.definition.description.clone(),
                server: registered.server.clone(),
            })
            .collect()
    }

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<String, BrokerError> {
        self.call_impl(name, &arguments).await.map_err(|e| match e {
            McpError::UnknownTool { tool } => BrokerError::UnknownTool { name: tool },
            other => BrokerError::Execution {
                name: name.to_owned(),
                reason: other.to_string(),
            },
        })
    }

    async fn close(&self) {
        McpManager::close(self).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
