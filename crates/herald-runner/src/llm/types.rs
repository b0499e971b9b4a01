//! Wire types for LLM interaction.
//!
//! These types model the data flowing between the orchestrator and the
//! platform's completion surface. They are provider-agnostic at this layer;
//! [`super::client`] translates them into the OpenAI-compatible wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the inbound event.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content. For [`Role::Tool`] messages this is the
    /// serialized tool result; for assistant messages that only carry tool
    /// calls it may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// The call this message responds to (only on [`Role::Tool`] messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that carries tool calls.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a tool-result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the model for correlating results.
    pub id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON value.
    pub arguments: Value,
}

/// A tool definition attached to a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Shown to the model so it knows what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Completion request / response
// ---------------------------------------------------------------------------

/// Token usage reported by the model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens generated by the model.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total billed tokens.
    #[serde(default)]
    pub total_tokens: u32,
}

/// A full completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Model identifier.
    pub model: String,

    /// Conversation history, oldest first.
    pub messages: Vec<Message>,

    /// Tools the model may invoke.
    pub tools: Vec<ToolDefinition>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Maximum tokens the model may generate.
    pub max_tokens: Option<u32>,

    /// Platform session carrying conversation memory.
    pub session_id: Option<String>,

    /// Whether the platform should weave session memory into the prompt.
    pub include_memory: bool,
}

/// The model's answer to one completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    /// Final text content (may be empty when tool calls are requested).
    pub content: String,

    /// The model that produced the response.
    pub model: String,

    /// Tool invocations the model wants before continuing.
    pub tool_calls: Vec<ToolCall>,

    /// Why generation stopped (`"stop"`, `"tool_calls"`, ...).
    pub finish_reason: String,

    /// Token usage for this request.
    pub usage: Usage,
}
