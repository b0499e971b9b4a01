//! In-process platform.
//!
//! [`StandalonePlatform`] implements the [`Platform`] seam without any wire
//! protocol: topics are fanned out in-process, request/reply rides on
//! generated reply inboxes, completions delegate to an OpenAI-compatible
//! [`LlmClient`], and sessions are opaque generated identifiers. It backs
//! the CLI's self-contained mode and the integration tests; a production
//! deployment substitutes the platform SDK's client instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, RunnerError};
use crate::llm::client::LlmClient;
use crate::llm::types::{CompletionRequest, CompletionResponse};
use crate::platform::{Platform, SessionProfile, SubscribeMessage, Subscription};

struct Inner {
    /// topic -> live subscriber senders, keyed for unsubscription.
    subscribers: RwLock<HashMap<String, Vec<(u64, mpsc::UnboundedSender<SubscribeMessage>)>>>,
    next_subscriber: AtomicU64,
    llm: Option<LlmClient>,
}

/// An in-process pub/sub + completion platform.
#[derive(Clone)]
pub struct StandalonePlatform {
    inner: Arc<Inner>,
}

impl StandalonePlatform {
    /// Platform with no completion surface; `complete` fails until an LLM
    /// client is attached.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
                llm: None,
            }),
        }
    }

    /// Platform whose completions go to the given LLM endpoint.
    pub fn with_llm(llm: LlmClient) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
                llm: Some(llm),
            }),
        }
    }

    fn deliver(&self, msg: SubscribeMessage) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("subscriber map lock poisoned");

        if let Some(entries) = subscribers.get_mut(&msg.topic) {
            entries.retain(|(_, sender)| sender.send(msg.clone()).is_ok());
        }
    }

    fn add_subscriber(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .write()
            .expect("subscriber map lock poisoned")
            .entry(topic.to_owned())
            .or_default()
            .push((id, tx));

        let inner = Arc::clone(&self.inner);
        let unsubscribe_topic = topic.to_owned();
        let unsubscribe = Box::new(move || {
            let mut subscribers = inner
                .subscribers
                .write()
                .expect("subscriber map lock poisoned");
            if let Some(entries) = subscribers.get_mut(&unsubscribe_topic) {
                entries.retain(|(entry_id, _)| *entry_id != id);
                if entries.is_empty() {
                    subscribers.remove(&unsubscribe_topic);
                }
            }
        });

        Subscription::new(topic, rx, Some(unsubscribe))
    }
}

impl Default for StandalonePlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for StandalonePlatform {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.deliver(SubscribeMessage::new(topic, payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        Ok(self.add_subscriber(topic))
    }

    async fn request(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let inbox = format!("_inbox.{}", Uuid::now_v7().simple());
        let mut replies = self.add_subscriber(&inbox);

        self.deliver(SubscribeMessage {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            reply: Some(inbox),
        });

        match replies.recv().await {
            Some(reply) => Ok(reply.payload),
            None => Err(RunnerError::Platform {
                reason: format!("no responder on {topic}"),
            }),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        match &self.inner.llm {
            Some(llm) => llm.chat(&request).await,
            None => Err(RunnerError::Completion {
                reason: "no LLM endpoint configured for standalone mode".into(),
            }),
        }
    }

    async fn create_session(&self, _profile: SessionProfile, _instructions: &str) -> Result<String> {
        // Standalone sessions are opaque handles; memory semantics belong to
        // a real platform.
        Ok(format!("session-{}", Uuid::now_v7().simple()))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .subscribers
            .write()
            .expect("subscriber map lock poisoned")
            .clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let platform = StandalonePlatform::new();
        let mut sub = platform.subscribe("news").await.unwrap();

        platform.publish("news", b"flash").await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "news");
        assert_eq!(msg.payload, b"flash");
        assert_eq!(msg.reply, None);
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let platform = StandalonePlatform::new();
        let mut first = platform.subscribe("t").await.unwrap();
        let mut second = platform.subscribe("t").await.unwrap();

        platform.publish("t", b"x").await.unwrap();

        assert_eq!(first.recv().await.unwrap().payload, b"x");
        assert_eq!(second.recv().await.unwrap().payload, b"x");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let platform = StandalonePlatform::new();
        platform.publish("void", b"x").await.unwrap();
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let platform = StandalonePlatform::new();
        let sub = platform.subscribe("t").await.unwrap();
        drop(sub);

        // The unsubscribe hook removed the entry entirely.
        platform.publish("t", b"x").await.unwrap();
        assert!(
            platform
                .inner
                .subscribers
                .read()
                .unwrap()
                .get("t")
                .is_none()
        );
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let platform = StandalonePlatform::new();
        let mut service = platform.subscribe("svc").await.unwrap();

        // A responder that answers each request on its reply inbox.
        let responder = {
            let platform = platform.clone();
            tokio::spawn(async move {
                let msg = service.recv().await.unwrap();
                let reply = msg.reply.expect("request must carry a reply inbox");
                platform.publish(&reply, b"pong").await.unwrap();
            })
        };

        let reply = tokio::time::timeout(
            Duration::from_secs(2),
            platform.request("svc", b"ping"),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(reply, b"pong");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn request_times_out_under_caller_deadline() {
        let platform = StandalonePlatform::new();
        // No responder subscribed: the caller's deadline bounds the wait.
        let result =
            tokio::time::timeout(Duration::from_millis(100), platform.request("void", b"x")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn complete_without_llm_fails() {
        let platform = StandalonePlatform::new();
        let err = platform
            .complete(CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Completion { .. }));
    }

    #[tokio::test]
    async fn sessions_are_unique() {
        let platform = StandalonePlatform::new();
        let profile = SessionProfile {
            kind: "rolling_window".into(),
            max_tokens: 4096,
            summarization_threshold: 3000,
        };

        let a = platform
            .create_session(profile.clone(), "instructions")
            .await
            .unwrap();
        let b = platform.create_session(profile, "instructions").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn close_clears_subscribers() {
        let platform = StandalonePlatform::new();
        let _sub = platform.subscribe("t").await.unwrap();
        platform.close().await.unwrap();
        assert!(platform.inner.subscribers.read().unwrap().is_empty());
    }
}
