//! The platform seam.
//!
//! [`Platform`] is everything the orchestrator needs from the external
//! pub/sub + completion + session platform: publish, subscribe, request,
//! complete, and create_session. The wire protocol behind those operations
//! is deliberately not part of this crate — a production SDK implements the
//! trait downstream, [`crate::standalone::StandalonePlatform`] implements it
//! in-process, and tests implement it with scripts.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::llm::types::{CompletionRequest, CompletionResponse};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One inbound event delivered by a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeMessage {
    /// The topic (or plugin name) the event arrived on.
    pub topic: String,

    /// Raw payload bytes.
    pub payload: Vec<u8>,

    /// Direct reply target for request/reply traffic.
    pub reply: Option<String>,
}

impl SubscribeMessage {
    /// Builds a plain event with no reply target.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            reply: None,
        }
    }
}

/// A live subscription: a stream of messages plus teardown.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<SubscribeMessage>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Assembles a subscription from its parts. Intended for [`Platform`]
    /// implementations.
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<SubscribeMessage>,
        unsubscribe: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            unsubscribe,
        }
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. Returns `None` once the publisher side is
    /// gone.
    pub async fn recv(&mut self) -> Option<SubscribeMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Session memory behavior requested from the platform.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    /// Profile kind, e.g. `"rolling_window"`.
    pub kind: String,
    /// Maximum tokens retained in memory.
    pub max_tokens: u32,
    /// Token count that triggers summarization.
    pub summarization_threshold: u32,
}

// ---------------------------------------------------------------------------
// Platform trait
// ---------------------------------------------------------------------------

/// The operations the orchestrator consumes from the platform.
///
/// Implementations must be safe to share across tasks; every method may be
/// called concurrently for distinct events.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Publishes a payload to a topic (fire-and-forget).
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Subscribes to a topic.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Publishes a payload and waits for a single reply. Callers bound the
    /// wait with their own deadline.
    async fn request(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Runs one LLM completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Creates a durable conversation-memory session and returns its
    /// platform identifier.
    async fn create_session(&self, profile: SessionProfile, instructions: &str) -> Result<String>;

    /// Releases the connection.
    async fn close(&self) -> Result<()>;
}
