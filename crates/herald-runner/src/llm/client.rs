//! OpenAI-compatible LLM client.
//!
//! Speaks the Chat Completions API (OpenAI itself, plus compatible endpoints
//! such as Ollama, Together, and vLLM) in non-streaming mode with tool use.
//! The standalone platform delegates its `complete` operation here; a
//! production platform SDK brings its own completion surface instead.

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{Result, RunnerError};
use crate::llm::types::{CompletionRequest, CompletionResponse, Role, ToolCall, Usage};

/// Default OpenAI API base URL.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// Base URL up to (not including) `/chat/completions`.
    pub base_url: String,
    /// Bearer token. May be empty for local endpoints.
    pub api_key: String,
}

impl LlmClientConfig {
    /// Configuration for the OpenAI API.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_owned(),
            api_key: api_key.into(),
        }
    }

    /// Configuration for any OpenAI-compatible endpoint.
    pub fn compatible(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A non-streaming Chat Completions client.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: LlmClientConfig,
    http: reqwest::Client,
}

impl LlmClient {
    /// Creates a new client.
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(RunnerError::completion)?;
        Ok(Self { config, http })
    }

    /// Sends one completion request and parses the response.
    pub async fn chat(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let body = build_request_body(request);
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.config.api_key.is_empty() {
            let value = format!("Bearer {}", self.config.api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value).map_err(RunnerError::completion)?,
            );
        }

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(RunnerError::completion)?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(RunnerError::completion)?;

        if !status.is_success() {
            let detail = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(RunnerError::Completion {
                reason: format!("http {status}: {detail}"),
            });
        }

        parse_response(&payload)
    }
}

// ---------------------------------------------------------------------------
// Request building
// ---------------------------------------------------------------------------

/// Translates a [`CompletionRequest`] into the Chat Completions body.
fn build_request_body(request: &CompletionRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };

            let mut entry = json!({"role": role});

            if message.role == Role::Tool {
                entry["tool_call_id"] = json!(message.tool_call_id);
                entry["content"] = json!(message.content);
            } else if !message.tool_calls.is_empty() {
                entry["tool_calls"] = Value::Array(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect(),
                );
                if !message.content.is_empty() {
                    entry["content"] = json!(message.content);
                }
            } else {
                entry["content"] = json!(message.content);
            }

            entry
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect(),
        );
        body["tool_choice"] = json!("auto");
    }

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }

    body
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parses a Chat Completions response body.
pub(crate) fn parse_response(payload: &Value) -> Result<CompletionResponse> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| RunnerError::Completion {
            reason: "response has no choices".to_owned(),
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id")?.as_str()?.to_owned();
                    let name = call.pointer("/function/name")?.as_str()?.to_owned();
                    let raw_args = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    // Arguments arrive as a JSON-encoded string; keep the raw
                    // text when it does not parse so the tool sees something.
                    let arguments = serde_json::from_str(raw_args)
                        .unwrap_or_else(|_| Value::String(raw_args.to_owned()));
                    Some(ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = payload
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let usage = payload
        .get("usage")
        .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
        .unwrap_or_default();

    Ok(CompletionResponse {
        content,
        model,
        tool_calls,
        finish_reason,
        usage,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, ToolDefinition};

    #[test]
    fn parse_text_response() {
        let payload = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });

        let response = parse_response(&payload).unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.model, "gpt-4o");
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.usage.total_tokens, 15);
    }

    #[test]
    fn parse_tool_call_response() {
        let payload = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"city\": \"Tokyo\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });

        let response = parse_response(&payload).unwrap();
        assert!(response.content.is_empty());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_1");
        assert_eq!(response.tool_calls[0].name, "get_weather");
        assert_eq!(response.tool_calls[0].arguments["city"], "Tokyo");
        assert_eq!(response.finish_reason, "tool_calls");
        // Missing usage defaults to zero.
        assert_eq!(response.usage.total_tokens, 0);
    }

    #[test]
    fn parse_unparseable_arguments_kept_as_string() {
        let payload = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "t", "arguments": "{broken"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });

        let response = parse_response(&payload).unwrap();
        assert_eq!(
            response.tool_calls[0].arguments,
            Value::String("{broken".to_owned())
        );
    }

    #[test]
    fn parse_empty_response_is_error() {
        let payload = json!({"choices": []});
        assert!(parse_response(&payload).is_err());
    }

    #[test]
    fn build_body_includes_tools_and_choice() {
        let request = CompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            tools: vec![ToolDefinition {
                name: "lookup".into(),
                description: "Looks things up".into(),
                parameters: json!({"type": "object"}),
            }],
            temperature: Some(0.7),
            max_tokens: Some(2048),
            session_id: None,
            include_memory: false,
        };

        let body = build_request_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["max_tokens"], 2048);
    }

    #[test]
    fn build_body_without_tools_omits_choice() {
        let request = CompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            ..CompletionRequest::default()
        };

        let body = build_request_body(&request);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn build_body_serializes_tool_round_trip() {
        let call = ToolCall {
            id: "call_9".into(),
            name: "lookup".into(),
            arguments: json!({"q": "x"}),
        };
        let request = CompletionRequest {
            model: "m".into(),
            messages: vec![
                Message::user("question"),
                Message::assistant_tool_calls(vec![call]),
                Message::tool_result("call_9", "result text"),
            ],
            ..CompletionRequest::default()
        };

        let body = build_request_body(&request);
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"x\"}"
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_9");
        assert_eq!(messages[2]["content"], "result text");
    }
}
