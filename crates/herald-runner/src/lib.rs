//! Herald message orchestration.
//!
//! This crate is the agent's core: it consumes inbound events (platform
//! subscriptions or adapter sources), drives the bounded LLM completion/tool
//! loop, resolves sessions and routing, and dispatches results to
//! destinations.
//!
//! - **[`platform`]** -- the [`Platform`] trait: everything the orchestrator
//!   needs from the external pub/sub + completion + session platform.
//! - **[`broker`]** -- the [`ToolBroker`] trait for remotely hosted tools.
//! - **[`llm`]** -- wire types and the OpenAI-compatible HTTP client.
//! - **[`handler`]** -- [`MessageHandler`], the per-event pipeline, plus the
//!   interactive direct-chat / publish / request / watch operations.
//! - **[`events`]** -- the bounded, non-blocking observability stream.
//! - **[`runner`]** -- [`Runner`], the lifecycle that wires a [`Config`] to
//!   running consumers.
//! - **[`standalone`]** -- an in-process [`Platform`] for self-contained
//!   operation and tests.
//!
//! [`Config`]: herald_config::Config

pub mod broker;
pub mod error;
pub mod events;
pub mod handler;
pub mod llm;
pub mod platform;
pub mod runner;
pub mod standalone;

#[cfg(test)]
mod testing;

pub use broker::{BrokerError, ToolBroker, ToolInfo};
pub use error::{Result, RunnerError};
pub use events::{Event, EventBus, MessageDirection, ToolStatus, event_channel};
pub use handler::{ChatReply, MessageHandler, Response, WatchCallback};
pub use llm::{
    CompletionRequest, CompletionResponse, LlmClient, LlmClientConfig, Message, Role, ToolCall,
    ToolDefinition, Usage,
};
pub use platform::{Platform, SessionProfile, SubscribeMessage, Subscription};
pub use runner::Runner;
pub use standalone::StandalonePlatform;
