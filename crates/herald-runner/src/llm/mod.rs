//! LLM wire types and the OpenAI-compatible client.

pub mod client;
pub mod types;

pub use client::{LlmClient, LlmClientConfig};
pub use types::{
    CompletionRequest, CompletionResponse, Message, Role, ToolCall, ToolDefinition, Usage,
};
