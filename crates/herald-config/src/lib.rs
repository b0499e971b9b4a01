//! Typed configuration for the Herald agent.
//!
//! An agent is described by a single YAML file with an `agent:` root key:
//!
//! ```yaml
//! agent:
//!   name: support-classifier
//!   model: gpt-4o
//!   instructions: "Classify incoming tickets."
//!   topics:
//!     subscribe: [ticket.new]
//!     publish: [ticket.unknown]
//!     routes:
//!       - topic: ticket.billing
//!         description: "Billing and invoice issues"
//!   plugins:
//!     - name: file-sink
//!       file: plugins/file_sink.lua
//!       restrict: [http]
//!       config: { path: /tmp/out.txt }
//! ```
//!
//! [`Config::validate`] collects every problem in one pass rather than
//! stopping at the first, so a broken file is fixable in a single round.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{ConfigError, Result};

// ---------------------------------------------------------------------------
// Root document
// ---------------------------------------------------------------------------

/// A complete agent YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The agent definition.
    #[serde(default)]
    pub agent: AgentConfig,
}

/// The agent's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Unique agent name, reported to the platform on connect.
    pub name: String,

    /// Human-readable description of what the agent does.
    pub description: String,

    /// Model identifier used for every completion request.
    pub model: String,

    /// System instructions prepended to every conversation.
    pub instructions: String,

    /// Lua adapters loaded at startup.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,

    /// Pub/sub topics and dynamic routes.
    pub topics: TopicsConfig,

    /// Optional session-memory settings.
    pub memory: MemoryConfig,

    /// MCP tool servers to connect to.
    pub mcp: McpConfig,

    /// Platform connection options.
    pub connection: ConnectionConfig,

    /// Upper bound on completion/tool round-trips per inbound event.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
}

fn default_max_tool_iterations() -> usize {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            model: String::new(),
            instructions: String::new(),
            plugins: Vec::new(),
            topics: TopicsConfig::default(),
            memory: MemoryConfig::default(),
            mcp: McpConfig::default(),
            connection: ConnectionConfig::default(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// A Lua adapter definition.
///
/// The `name` doubles as a pseudo-topic: a subscribe or publish entry that
/// matches a loaded plugin name is served by that plugin instead of the
/// platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Unique plugin name.
    pub name: String,

    /// Path to the Lua script.
    pub file: String,

    /// Capability identifiers blocked for this plugin, either a bare module
    /// (`"fs"`) or a single function (`"http.post"`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restrict: Vec<String>,

    /// Static configuration passed to the script's entry points.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Topics and routes
// ---------------------------------------------------------------------------

/// Pub/sub topic wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Topics (or plugin names) the agent consumes events from.
    pub subscribe: Vec<String>,

    /// Default destinations for results.
    pub publish: Vec<String>,

    /// Dynamic routing destinations the model may pick from.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

/// A dynamic routing destination.
///
/// The model can direct a result to one of these instead of the default
/// publish set by returning a `route_to` field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Destination name (platform topic or plugin name).
    pub topic: String,

    /// Shown to the model so it can pick the right destination.
    pub description: String,
}

impl TopicsConfig {
    /// Returns true if dynamic routes are configured.
    pub fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Returns true if `topic` is one of the configured routes.
    pub fn is_valid_route(&self, topic: &str) -> bool {
        self.routes.iter().any(|r| r.topic == topic)
    }

    /// Builds the routing-instructions block appended to the system prompt
    /// when routes are configured.
    pub fn build_routing_prompt(&self) -> String {
        if !self.has_routes() {
            return String::new();
        }

        let mut prompt = String::new();
        prompt.push_str("\n\n## Routing Instructions\n");
        prompt.push_str(
            "Based on your analysis, route this message to the appropriate destination.\n",
        );
        prompt.push_str(
            "Include a `route_to` field in your JSON response with one of these topics:\n\n",
        );

        for route in &self.routes {
            let _ = writeln!(prompt, "- `{}`: {}", route.topic, route.description);
        }

        prompt.push_str("\nExample response format:\n");
        prompt.push_str("```json\n");
        prompt.push_str("{\n");
        prompt.push_str("  \"route_to\": \"<topic>\",\n");
        prompt.push_str("  \"content\": \"your analysis or response\"\n");
        prompt.push_str("}\n");
        prompt.push_str("```");

        prompt
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Optional session-memory settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether session memory is used at all.
    pub enabled: bool,

    /// Optional prefix prepended to platform session names.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_prefix: Option<String>,

    /// Session time-to-live, enforced by the platform (e.g. `"24h"`).
    /// Herald never evicts mappings locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    /// Session memory behavior.
    pub profile: SessionProfileConfig,
}

/// Session memory profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProfileConfig {
    /// Profile kind, e.g. `"rolling_window"`.
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Maximum tokens retained in memory.
    pub max_tokens: u32,

    /// Token count that triggers summarization.
    pub summarization_threshold: u32,
}

impl MemoryConfig {
    /// Returns the session profile with defaults applied.
    pub fn profile(&self) -> SessionProfileConfig {
        let mut profile = self.profile.clone();
        if profile.kind.is_empty() {
            profile.kind = "rolling_window".to_owned();
        }
        if profile.max_tokens == 0 {
            profile.max_tokens = 4096;
        }
        if profile.summarization_threshold == 0 {
            profile.summarization_threshold = 3000;
        }
        profile
    }
}

// ---------------------------------------------------------------------------
// MCP servers
// ---------------------------------------------------------------------------

/// MCP tool-server connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Servers to connect to at startup.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<McpServerConfig>,
}

/// A single MCP server.
///
/// Exactly one of `command` or `url` must be set:
/// - `command`: spawns a local subprocess (stdio transport)
/// - `url`: connects to a remote server (streamable-HTTP transport)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name, used in tool-origin bookkeeping.
    pub name: String,

    /// Command line for stdio servers (`[program, arg, ...]`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Endpoint URL for HTTP servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Environment variables for subprocess servers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Connection options
// ---------------------------------------------------------------------------

/// Platform connection options as written in YAML (duration strings).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Per-event request deadline (e.g. `"60s"`, `"2m"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Maximum reconnection retries (0 = infinite).
    pub max_retries: u32,

    /// Initial reconnect backoff (e.g. `"1s"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_backoff: Option<String>,

    /// Maximum reconnect backoff (e.g. `"30s"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff: Option<String>,
}

/// Parsed connection settings with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Per-event request deadline.
    pub request_timeout: Duration,
    /// Maximum reconnection retries (0 = infinite).
    pub max_retries: u32,
    /// Initial reconnect backoff.
    pub base_backoff: Duration,
    /// Maximum reconnect backoff.
    pub max_backoff: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_retries: 0,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    /// Parses the duration strings and returns options with defaults applied.
    pub fn options(&self) -> Result<ConnectionOptions> {
        let mut opts = ConnectionOptions::default();

        if let Some(timeout) = &self.timeout {
            opts.request_timeout = parse_duration("connection.timeout", timeout)?;
        }
        if self.max_retries != 0 {
            opts.max_retries = self.max_retries;
        }
        if let Some(backoff) = &self.base_backoff {
            opts.base_backoff = parse_duration("connection.base_backoff", backoff)?;
        }
        if let Some(backoff) = &self.max_backoff {
            opts.max_backoff = parse_duration("connection.max_backoff", backoff)?;
        }

        Ok(opts)
    }
}

/// Parses a duration string of the form `<number><unit>` where unit is one of
/// `ms`, `s`, `m`, `h`. Fractions are allowed (`"1.5s"`).
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let err = || ConfigError::InvalidDuration {
        field: field.to_owned(),
        value: value.to_owned(),
    };

    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(err)?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().map_err(|_| err())?;
    if !number.is_finite() || number < 0.0 {
        return Err(err());
    }

    let secs = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(err()),
    };

    Ok(Duration::from_secs_f64(secs))
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Loads and parses a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Parses YAML text into a [`Config`].
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Checks that the config contains all required fields.
    ///
    /// Every problem is collected before returning, so the error lists the
    /// full set of issues at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let agent = &self.agent;

        if agent.name.is_empty() {
            problems.push("agent.name is required".to_owned());
        }
        if agent.model.is_empty() {
            problems.push("agent.model is required".to_owned());
        }
        if agent.topics.subscribe.is_empty() {
            problems.push("agent.topics.subscribe must have at least one topic".to_owned());
        }
        if agent.topics.publish.is_empty() {
            problems.push("agent.topics.publish must have at least one topic".to_owned());
        }
        if agent.max_tool_iterations == 0 {
            problems.push("agent.max_tool_iterations must be at least 1".to_owned());
        }

        for (i, route) in agent.topics.routes.iter().enumerate() {
            if route.topic.is_empty() {
                problems.push(format!("agent.topics.routes[{i}].topic is required"));
            }
            if route.description.is_empty() {
                problems.push(format!("agent.topics.routes[{i}].description is required"));
            }
        }

        let mut plugin_names: HashMap<&str, ()> = HashMap::new();
        for (i, plugin) in agent.plugins.iter().enumerate() {
            if plugin.name.is_empty() {
                problems.push(format!("agent.plugins[{i}].name is required"));
            }
            if plugin.file.is_empty() {
                problems.push(format!("agent.plugins[{i}].file is required"));
            }
            if !plugin.name.is_empty()
                && plugin_names.insert(&plugin.name, ()).is_some()
            {
                problems.push(format!(
                    "agent.plugins[{i}]: duplicate plugin name {:?}",
                    plugin.name
                ));
            }
        }

        for (i, server) in agent.mcp.servers.iter().enumerate() {
            if server.name.is_empty() {
                problems.push(format!("agent.mcp.servers[{i}].name is required"));
            }
            let has_command = !server.command.is_empty();
            let has_url = server.url.is_some();
            if has_command && has_url {
                problems.push(format!(
                    "agent.mcp.servers[{i}] must specify either command or url, not both"
                ));
            }
            if !has_command && !has_url {
                problems.push(format!(
                    "agent.mcp.servers[{i}] must specify either command or url"
                ));
            }
        }

        // Durations are parsed during validation so a bad string is caught
        // before the agent connects.
        if let Err(e) = agent.connection.options() {
            problems.push(e.to_string());
        }
        if let Some(ttl) = &agent.memory.ttl {
            if let Err(e) = parse_duration("agent.memory.ttl", ttl) {
                problems.push(e.to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
