//! The message orchestrator.
//!
//! One inbound event at a time flows through [`MessageHandler::handle`]:
//! payload parsing, session resolution, the bounded completion/tool loop,
//! the routing decision, and dispatch to destinations. A loaded adapter and
//! a platform topic are interchangeable destinations resolved through one
//! lookup.
//!
//! Degradation policy: a payload that fails JSON parsing is plain text; a
//! failed session creation drops memory for that event; a failed tool call
//! becomes an error payload the model sees; an invalid route falls back to
//! the default publish set; a failed destination does not block the rest.
//! Nothing in this pipeline takes the process down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use herald_config::{Config, ConnectionOptions};
use herald_plugin::PluginManager;

use crate::broker::ToolBroker;
use crate::error::{Result, RunnerError};
use crate::events::{Event, EventBus, MessageDirection, ToolStatus};
use crate::llm::types::{
    CompletionRequest, CompletionResponse, Message, ToolDefinition,
};
use crate::platform::{Platform, SessionProfile, SubscribeMessage};

/// Deadline for one interactive chat round.
const DIRECT_CHAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for a fire-and-forget publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a request/reply round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sampling temperature for completions.
const TEMPERATURE: f32 = 0.7;

/// Token budget per completion.
const MAX_TOKENS: u32 = 2048;

// ---------------------------------------------------------------------------
// Outbound result
// ---------------------------------------------------------------------------

/// The structure published to platform destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub model: String,
    pub source_topic: String,
    pub tokens: u32,
    pub finish_reason: String,
}

/// Result of an interactive chat round.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub model: String,
    pub tokens: u32,
}

/// Called for each message seen on a watched topic.
pub type WatchCallback = Arc<dyn Fn(DateTime<Utc>, String) + Send + Sync>;

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// A named sink for orchestrator output, resolved through one lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Destination {
    /// A loaded adapter's `publish` entry point.
    Plugin(String),
    /// A platform topic.
    Topic(String),
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Processes inbound events through the LLM and dispatches the results.
pub struct MessageHandler {
    cfg: Arc<Config>,
    options: ConnectionOptions,
    platform: Arc<dyn Platform>,
    broker: Option<Arc<dyn ToolBroker>>,
    plugins: Option<Arc<PluginManager>>,
    events: Option<EventBus>,
    /// User-supplied session key -> platform session id. Grows for the
    /// process lifetime; eviction is the platform's concern.
    sessions: RwLock<HashMap<String, String>>,
    watch: Mutex<Option<WatchHandle>>,
}

struct WatchHandle {
    topic: String,
    task: tokio::task::JoinHandle<()>,
}

impl MessageHandler {
    /// Creates a handler over the given collaborators.
    pub fn new(
        cfg: Arc<Config>,
        platform: Arc<dyn Platform>,
        broker: Option<Arc<dyn ToolBroker>>,
        plugins: Option<Arc<PluginManager>>,
        events: Option<EventBus>,
    ) -> Result<Self> {
        let options = cfg.agent.connection.options()?;
        Ok(Self {
            cfg,
            options,
            platform,
            broker,
            plugins,
            events,
            sessions: RwLock::new(HashMap::new()),
            watch: Mutex::new(None),
        })
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    // -----------------------------------------------------------------------
    // Inbound pipeline
    // -----------------------------------------------------------------------

    /// Processes a single inbound event.
    ///
    /// The whole pipeline runs under one deadline; on expiry the in-flight
    /// calls of this event are aborted and the failure is logged with the
    /// event's trace id. Failures never propagate to the caller — a broken
    /// event must not take down the consumer loop.
    pub async fn handle(&self, msg: SubscribeMessage) {
        let trace_id = new_trace_id();
        let started = Instant::now();

        tracing::info!(
            trace_id = %trace_id,
            topic = %msg.topic,
            size_bytes = msg.payload.len(),
            "message received"
        );

        let deadline = self.options.request_timeout;
        if tokio::time::timeout(deadline, self.process(&msg, &trace_id))
            .await
            .is_err()
        {
            tracing::error!(
                trace_id = %trace_id,
                topic = %msg.topic,
                timeout_s = deadline.as_secs(),
                "event deadline exceeded; aborted in-flight calls"
            );
        }

        tracing::debug!(
            trace_id = %trace_id,
            total_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
    }

    async fn process(&self, msg: &SubscribeMessage, trace_id: &str) {
        let (session_key, content) = parse_payload(&msg.payload);

        self.emit(Event::Message {
            time: Utc::now(),
            direction: MessageDirection::Incoming,
            topic: msg.topic.clone(),
            content: content.clone(),
            model: None,
            tokens: None,
        });

        // Resolve session mapping if memory is enabled and a key is present.
        let mut session_id = None;
        if self.cfg.agent.memory.enabled {
            if let Some(key) = &session_key {
                session_id = self.ensure_session(trace_id, key).await;
            }
        }

        let messages = self.build_context(&content, true);
        let tools = self.available_tools();

        let response = match self
            .run_tool_loop(trace_id, messages, tools, session_id)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(trace_id = %trace_id, error = %e, "completion pipeline failed");
                return;
            }
        };

        // Dynamic routing: a valid route becomes the sole destination, an
        // unrecognized one is logged and ignored.
        let mut route = extract_route(&response.content);
        if let Some(topic) = &route {
            if self.cfg.agent.topics.is_valid_route(topic) {
                tracing::debug!(trace_id = %trace_id, route_to = %topic, "routing response");
            } else {
                tracing::warn!(
                    trace_id = %trace_id,
                    route_to = %topic,
                    "invalid route_to, using default publish"
                );
                route = None;
            }
        }

        let targets = match route {
            Some(topic) => vec![topic],
            None => self.cfg.agent.topics.publish.clone(),
        };

        self.dispatch(msg, trace_id, &response, &targets).await;
    }

    async fn dispatch(
        &self,
        msg: &SubscribeMessage,
        trace_id: &str,
        response: &CompletionResponse,
        targets: &[String],
    ) {
        let outbound = Response {
            content: response.content.clone(),
            model: response.model.clone(),
            source_topic: msg.topic.clone(),
            tokens: response.usage.total_tokens,
            finish_reason: response.finish_reason.clone(),
        };
        let payload = match serde_json::to_vec(&outbound) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(trace_id = %trace_id, error = %e, "failed to serialize response");
                return;
            }
        };

        for target in targets {
            // Adapters receive the bare content; topics the full response
            // object.
            let result = match (self.resolve_destination(target), &self.plugins) {
                (Destination::Plugin(name), Some(plugins)) => plugins
                    .publish(&name, &response.content)
                    .await
                    .map_err(RunnerError::from),
                (Destination::Plugin(name), None) => Err(RunnerError::Platform {
                    reason: format!("plugin '{name}' resolved without a registry"),
                }),
                (Destination::Topic(topic), _) => self.platform.publish(&topic, &payload).await,
            };

            match result {
                Ok(()) => {
                    tracing::info!(
                        trace_id = %trace_id,
                        topic = %target,
                        size_bytes = payload.len(),
                        "message sent"
                    );
                    self.emit(Event::Message {
                        time: Utc::now(),
                        direction: MessageDirection::Outgoing,
                        topic: target.clone(),
                        content: response.content.clone(),
                        model: Some(response.model.clone()),
                        tokens: Some(response.usage.total_tokens),
                    });
                }
                Err(e) => {
                    tracing::error!(
                        trace_id = %trace_id,
                        topic = %target,
                        error = %e,
                        "message send failed"
                    );
                }
            }
        }

        // Request/reply traffic gets a direct answer regardless of how
        // destination resolution went.
        if let Some(reply) = &msg.reply {
            if let Err(e) = self.platform.publish(reply, &payload).await {
                tracing::error!(trace_id = %trace_id, reply = %reply, error = %e, "reply failed");
            }
        }
    }

    fn resolve_destination(&self, name: &str) -> Destination {
        match &self.plugins {
            Some(plugins) if plugins.is_plugin(name) => Destination::Plugin(name.to_owned()),
            _ => Destination::Topic(name.to_owned()),
        }
    }

    fn available_tools(&self) -> Vec<ToolDefinition> {
        self.broker
            .as_ref()
            .map(|broker| broker.tools())
            .unwrap_or_default()
    }

    /// Builds the fresh conversation context for one event.
    fn build_context(&self, content: &str, with_routes: bool) -> Vec<Message> {
        let mut messages = Vec::new();

        if !self.cfg.agent.instructions.is_empty() {
            let mut system = self.cfg.agent.instructions.clone();
            if with_routes && self.cfg.agent.topics.has_routes() {
                system.push_str(&self.cfg.agent.topics.build_routing_prompt());
            }
            messages.push(Message::system(system));
        }

        messages.push(Message::user(content));
        messages
    }

    // -----------------------------------------------------------------------
    // Tool loop
    // -----------------------------------------------------------------------

    /// Runs the bounded completion/tool loop and returns the last response.
    ///
    /// Tool calls from one completion execute strictly in response order and
    /// each result is appended before the next request. A failed call feeds
    /// an error payload back to the model instead of aborting. On hitting
    /// the iteration bound, the last completion received wins.
    async fn run_tool_loop(
        &self,
        trace_id: &str,
        mut messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        session_id: Option<String>,
    ) -> Result<CompletionResponse> {
        let mut last_response = None;

        for iteration in 0..self.cfg.agent.max_tool_iterations {
            let request = CompletionRequest {
                model: self.cfg.agent.model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                temperature: Some(TEMPERATURE),
                max_tokens: Some(MAX_TOKENS),
                session_id: session_id.clone(),
                include_memory: session_id.is_some(),
            };

            let llm_started = Instant::now();
            tracing::debug!(
                trace_id = %trace_id,
                model = %request.model,
                iteration = iteration + 1,
                "llm request"
            );

            let response = self.platform.complete(request).await.map_err(|e| {
                tracing::error!(
                    trace_id = %trace_id,
                    error = %e,
                    latency_ms = llm_started.elapsed().as_millis() as u64,
                    "llm failed"
                );
                e
            })?;

            tracing::info!(
                trace_id = %trace_id,
                model = %response.model,
                tokens_in = response.usage.prompt_tokens,
                tokens_out = response.usage.completion_tokens,
                latency_ms = llm_started.elapsed().as_millis() as u64,
                "llm completed"
            );

            let tool_calls = response.tool_calls.clone();
            last_response = Some(response);

            // An empty tool-call list ends the loop.
            if tool_calls.is_empty() {
                break;
            }

            messages.push(Message::assistant_tool_calls(tool_calls.clone()));

            for call in tool_calls {
                let args_text = call.arguments.to_string();
                let tool_started = Instant::now();
                self.emit(Event::Tool {
                    time: Utc::now(),
                    status: ToolStatus::Started,
                    name: call.name.clone(),
                    args: args_text.clone(),
                    result: None,
                    error: None,
                    duration: None,
                });

                let result = match &self.broker {
                    Some(broker) => broker
                        .call(&call.name, call.arguments.clone())
                        .await
                        .map_err(RunnerError::from),
                    None => Err(RunnerError::Completion {
                        reason: "no tool broker configured".into(),
                    }),
                };
                let duration = tool_started.elapsed();

                let content = match result {
                    Ok(result) => {
                        tracing::info!(
                            trace_id = %trace_id,
                            tool = %call.name,
                            latency_ms = duration.as_millis() as u64,
                            success = true,
                            "tool executed"
                        );
                        self.emit(Event::Tool {
                            time: Utc::now(),
                            status: ToolStatus::Completed,
                            name: call.name.clone(),
                            args: args_text,
                            result: Some(result.clone()),
                            error: None,
                            duration: Some(duration),
                        });
                        result
                    }
                    Err(e) => {
                        tracing::error!(
                            trace_id = %trace_id,
                            tool = %call.name,
                            error = %e,
                            latency_ms = duration.as_millis() as u64,
                            "tool failed"
                        );
                        self.emit(Event::Tool {
                            time: Utc::now(),
                            status: ToolStatus::Failed,
                            name: call.name.clone(),
                            args: args_text,
                            result: None,
                            error: Some(e.to_string()),
                            duration: Some(duration),
                        });
                        serde_json::json!({"error": e.to_string()}).to_string()
                    }
                };

                messages.push(Message::tool_result(call.id, content));
            }
        }

        last_response.ok_or(RunnerError::NoResponse)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Create-on-first-use session mapping. Creation failure is logged and
    /// the event proceeds without memory.
    async fn ensure_session(&self, trace_id: &str, user_key: &str) -> Option<String> {
        if let Some(id) = self.sessions.read().await.get(user_key) {
            return Some(id.clone());
        }

        // Take the write lock across creation so one key maps to exactly
        // one platform session even under concurrent first sightings.
        let mut sessions = self.sessions.write().await;
        if let Some(id) = sessions.get(user_key) {
            return Some(id.clone());
        }

        tracing::info!(trace_id = %trace_id, session_key = %user_key, "creating session");

        let profile = self.cfg.agent.memory.profile();
        let created = self
            .platform
            .create_session(
                SessionProfile {
                    kind: profile.kind,
                    max_tokens: profile.max_tokens,
                    summarization_threshold: profile.summarization_threshold,
                },
                &self.cfg.agent.instructions,
            )
            .await;

        match created {
            Ok(id) => {
                sessions.insert(user_key.to_owned(), id.clone());
                tracing::info!(
                    trace_id = %trace_id,
                    session_key = %user_key,
                    session_id = %id,
                    "session created"
                );
                Some(id)
            }
            Err(e) => {
                tracing::error!(
                    trace_id = %trace_id,
                    session_key = %user_key,
                    error = %e,
                    "failed to create session; continuing without memory"
                );
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interactive helper paths
    // -----------------------------------------------------------------------

    /// Sends a message straight to the model, bypassing pub/sub. Runs the
    /// same tool loop without routing or dispatch.
    pub async fn direct_chat(&self, content: &str) -> Result<ChatReply> {
        let trace_id = new_trace_id();
        let messages = self.build_context(content, false);
        let tools = self.available_tools();

        let response = tokio::time::timeout(
            DIRECT_CHAT_TIMEOUT,
            self.run_tool_loop(&trace_id, messages, tools, None),
        )
        .await
        .map_err(|_| RunnerError::Timeout {
            seconds: DIRECT_CHAT_TIMEOUT.as_secs(),
        })??;

        Ok(ChatReply {
            content: response.content,
            model: response.model,
            tokens: response.usage.total_tokens,
        })
    }

    /// Fire-and-forget publish to a platform topic.
    pub async fn publish_message(&self, topic: &str, payload: &[u8]) -> Result<()> {
        tracing::debug!(topic = %topic, size = payload.len(), "publishing message");

        self.emit(Event::Message {
            time: Utc::now(),
            direction: MessageDirection::Outgoing,
            topic: topic.to_owned(),
            content: String::from_utf8_lossy(payload).into_owned(),
            model: None,
            tokens: None,
        });

        tokio::time::timeout(PUBLISH_TIMEOUT, self.platform.publish(topic, payload))
            .await
            .map_err(|_| RunnerError::Timeout {
                seconds: PUBLISH_TIMEOUT.as_secs(),
            })?
    }

    /// Request/reply round trip over the platform.
    pub async fn request_message(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        tracing::debug!(topic = %topic, size = payload.len(), "sending request");

        self.emit(Event::Message {
            time: Utc::now(),
            direction: MessageDirection::Outgoing,
            topic: topic.to_owned(),
            content: String::from_utf8_lossy(payload).into_owned(),
            model: None,
            tokens: None,
        });

        let reply = tokio::time::timeout(REQUEST_TIMEOUT, self.platform.request(topic, payload))
            .await
            .map_err(|_| RunnerError::Timeout {
                seconds: REQUEST_TIMEOUT.as_secs(),
            })??;

        self.emit(Event::Message {
            time: Utc::now(),
            direction: MessageDirection::Incoming,
            topic: format!("{topic}.reply"),
            content: String::from_utf8_lossy(&reply).into_owned(),
            model: None,
            tokens: None,
        });

        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Watch
    // -----------------------------------------------------------------------

    /// Subscribes to a topic and invokes the callback per message. Only one
    /// topic is watched at a time; watching again replaces the previous
    /// subscription.
    pub async fn watch_topic(&self, topic: &str, callback: WatchCallback) -> Result<()> {
        self.stop_watching().await;

        tracing::debug!(topic = %topic, "starting watch");
        let mut subscription = self.platform.subscribe(topic).await?;

        let task = tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                callback(
                    Utc::now(),
                    String::from_utf8_lossy(&msg.payload).into_owned(),
                );
            }
        });

        *self.watch.lock().await = Some(WatchHandle {
            topic: topic.to_owned(),
            task,
        });

        tracing::info!(topic = %topic, "watching topic");
        Ok(())
    }

    /// Stops the current watch, if any.
    pub async fn stop_watching(&self) {
        if let Some(handle) = self.watch.lock().await.take() {
            tracing::debug!(topic = %handle.topic, "stopping watch");
            handle.task.abort();
        }
    }

    /// The currently watched topic.
    pub async fn watching_topic(&self) -> Option<String> {
        self.watch
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.topic.clone())
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    session: String,
    #[serde(default)]
    content: String,
}

/// Extracts the session key and content from an inbound payload.
///
/// JSON with a non-empty `content` field yields that text plus the optional
/// `session` key; anything else is literal text with no session.
fn parse_payload(payload: &[u8]) -> (Option<String>, String) {
    if let Ok(msg) = serde_json::from_slice::<IncomingMessage>(payload) {
        if !msg.content.is_empty() {
            let session = (!msg.session.is_empty()).then_some(msg.session);
            return (session, msg.content);
        }
    }
    (None, String::from_utf8_lossy(payload).into_owned())
}

// ---------------------------------------------------------------------------
// Route extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RouteDecision {
    #[serde(default)]
    route_to: String,
}

/// Extracts a `route_to` decision from the model's final text, unwrapping a
/// fenced code block when present. Returns `None` for non-JSON content or an
/// empty field.
fn extract_route(content: &str) -> Option<String> {
    let json = unwrap_code_fence(content);
    let decision: RouteDecision = serde_json::from_str(json.trim()).ok()?;
    (!decision.route_to.is_empty()).then_some(decision.route_to)
}

/// Strips a surrounding ``` / ```json fence; returns the content unchanged
/// when no fence is present.
fn unwrap_code_fence(content: &str) -> &str {
    let content = content.trim();

    for prefix in ["```json", "```"] {
        if let Some(rest) = content.strip_prefix(prefix) {
            if let Some(end) = rest.rfind("```") {
                return rest[..end].trim();
            }
            return rest.trim();
        }
    }

    content
}

fn new_trace_id() -> String {
    // Short id, enough to correlate one event's log lines.
    Uuid::now_v7().simple().to_string()[..8].to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
