//! Test doubles shared by the runner unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{BrokerError, ToolBroker, ToolInfo};
use crate::error::{Result, RunnerError};
use crate::llm::types::{CompletionRequest, CompletionResponse, ToolDefinition};
use crate::platform::{Platform, SessionProfile, SubscribeMessage, Subscription};

type CompleteFn =
    Box<dyn Fn(usize, &CompletionRequest) -> Result<CompletionResponse> + Send + Sync>;

/// A scriptable in-memory platform.
pub(crate) struct MockPlatform {
    complete_fn: CompleteFn,
    complete_delay: Option<Duration>,
    pub completions: AtomicUsize,
    pub requests: Mutex<Vec<CompletionRequest>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub sessions_created: AtomicUsize,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<SubscribeMessage>)>>,
}

impl MockPlatform {
    /// Platform whose completions are produced by `complete_fn`; the first
    /// argument is the 1-based completion call index.
    pub fn new(
        complete_fn: impl Fn(usize, &CompletionRequest) -> Result<CompletionResponse>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            complete_fn: Box::new(complete_fn),
            complete_delay: None,
            completions: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            sessions_created: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Platform that always answers with the same text.
    pub fn text(content: &str) -> Self {
        let content = content.to_owned();
        Self::new(move |_, _| {
            Ok(CompletionResponse {
                content: content.clone(),
                model: "mock-model".into(),
                finish_reason: "stop".into(),
                ..CompletionResponse::default()
            })
        })
    }

    /// Adds an artificial delay before every completion.
    pub fn with_complete_delay(mut self, delay: Duration) -> Self {
        self.complete_delay = Some(delay);
        self
    }

    /// Topics published so far.
    pub fn published_topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload.to_vec()));

        let subscribers = self.subscribers.lock().unwrap();
        for (subscribed, sender) in subscribers.iter() {
            if subscribed == topic {
                let _ = sender.send(SubscribeMessage::new(topic, payload.to_vec()));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .push((topic.to_owned(), tx));
        Ok(Subscription::new(topic, rx, None))
    }

    async fn request(&self, _topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        // Echo request/reply, good enough for helper-path tests.
        Ok(payload.to_vec())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        if let Some(delay) = self.complete_delay {
            tokio::time::sleep(delay).await;
        }
        let call = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        (self.complete_fn)(call, &request)
    }

    async fn create_session(&self, profile: SessionProfile, _instructions: &str) -> Result<String> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("server-sess-{}", profile.kind))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A platform whose session creation always fails.
pub(crate) struct FailingSessionPlatform {
    pub inner: MockPlatform,
}

#[async_trait]
impl Platform for FailingSessionPlatform {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.inner.subscribe(topic).await
    }

    async fn request(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.inner.request(topic, payload).await
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.inner.complete(request).await
    }

    async fn create_session(
        &self,
        _profile: SessionProfile,
        _instructions: &str,
    ) -> Result<String> {
        Err(RunnerError::Session {
            reason: "session store unavailable".into(),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

type ToolFn =
    Box<dyn Fn(&str, &serde_json::Value) -> std::result::Result<String, BrokerError> + Send + Sync>;

/// A broker with a fixed tool list and a scripted executor.
pub(crate) struct ScriptedBroker {
    definitions: Vec<ToolDefinition>,
    execute: ToolFn,
    pub calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedBroker {
    pub fn new(
        definitions: Vec<ToolDefinition>,
        execute: impl Fn(&str, &serde_json::Value) -> std::result::Result<String, BrokerError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            definitions,
            execute: Box::new(execute),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// One tool named `test_tool` answering with a fixed result.
    pub fn single(result: &str) -> Self {
        let result = result.to_owned();
        Self::new(vec![test_tool()], move |_, _| Ok(result.clone()))
    }

    /// One tool named `test_tool` failing every call.
    pub fn failing(reason: &str) -> Self {
        let reason = reason.to_owned();
        Self::new(vec![test_tool()], move |name, _| {
            Err(BrokerError::Execution {
                name: name.to_owned(),
                reason: reason.clone(),
            })
        })
    }
}

pub(crate) fn test_tool() -> ToolDefinition {
    ToolDefinition {
        name: "test_tool".into(),
        description: "A test tool".into(),
        parameters: serde_json::json!({"type": "object"}),
    }
}

#[async_trait]
impl ToolBroker for ScriptedBroker {
    fn tools(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    fn tools_info(&self) -> Vec<ToolInfo> {
        self.definitions
            .iter()
            .map(|def| ToolInfo {
                name: def.name.clone(),
                description: def.description.clone(),
                server: "scripted".into(),
            })
            .collect()
    }

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<String, BrokerError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_owned(), arguments.clone()));
        (self.execute)(name, &arguments)
    }

    async fn close(&self) {}
}
