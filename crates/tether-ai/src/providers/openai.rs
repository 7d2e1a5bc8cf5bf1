//! OpenAI-compatible Chat Completions provider
//!
//! Speaks the `/chat/completions` streaming dialect shared by OpenAI,
//! OpenRouter, Groq, Ollama and most self-hosted gateways.

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    stream::{StreamEvent, StreamEventStream},
    types::{Content, Context, Message, StopReason, Usage},
};

/// Default endpoint when no base URL is configured
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    headers: HashMap<String, String>,
}

impl OpenAIProvider {
    /// Create a provider for the default OpenAI endpoint
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            headers: HashMap::new(),
        }
    }

    /// Create from `OPENAI_API_KEY` / `OPENROUTER_API_KEY`
    pub fn from_env() -> Result<Self> {
        let api_key = super::get_api_key(None, &["OPENAI_API_KEY", "OPENROUTER_API_KEY"])?;
        Ok(Self::new(api_key))
    }

    /// Point the provider at another compatible endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Add an extra header sent with every request
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Stream one generation
    pub async fn stream(&self, context: &Context) -> Result<StreamEventStream> {
        let request = build_request(context);
        let url = format!("{}/chat/completions", self.base_url);

        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key)
            .parse()
            .map_err(|_| Error::InvalidApiKey)?;
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        for (key, value) in &self.headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            }
        }

        let request_builder = self.client.post(&url).headers(headers).json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        tracing::debug!(model = %context.model, messages = context.messages.len(), "Opened completion stream");
        Ok(Box::pin(create_stream(event_source)))
    }
}

fn build_request(context: &Context) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(ref system_prompt) = context.system_prompt {
        messages.push(ChatMessage {
            role: "system",
            content: Some(MessageContent::Text(system_prompt.clone())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in &context.messages {
        messages.push(convert_message(msg));
    }

    let tools: Vec<ChatTool> = context
        .tools
        .iter()
        .map(|t| ChatTool {
            tool_type: "function",
            function: ChatFunction {
                name: t.name.clone(),
                description: Some(t.description.clone()),
                parameters: Some(t.parameters.clone()),
            },
        })
        .collect();

    let has_tools = !tools.is_empty();
    ChatRequest {
        model: context.model.clone(),
        messages,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        max_tokens: context.max_tokens,
        tools: has_tools.then_some(tools),
        tool_choice: has_tools.then(|| serde_json::json!("auto")),
    }
}

fn joined_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| c.as_text())
        .collect::<Vec<_>>()
        .join("")
}

fn convert_message(msg: &Message) -> ChatMessage {
    match msg {
        Message::System { content } => ChatMessage {
            role: "system",
            content: Some(MessageContent::Text(joined_text(content))),
            tool_calls: None,
            tool_call_id: None,
        },
        Message::User { content } => {
            let has_images = content.iter().any(|c| matches!(c, Content::Image { .. }));
            let body = if has_images {
                MessageContent::Parts(
                    content
                        .iter()
                        .filter_map(|c| match c {
                            Content::Text { text } => Some(ContentPart::Text { text: text.clone() }),
                            Content::Image { data, mime_type } => Some(ContentPart::ImageUrl {
                                image_url: ImageUrl {
                                    url: format!("data:{};base64,{}", mime_type, data),
                                },
                            }),
                            _ => None,
                        })
                        .collect(),
                )
            } else {
                MessageContent::Text(joined_text(content))
            };
            ChatMessage {
                role: "user",
                content: Some(body),
                tool_calls: None,
                tool_call_id: None,
            }
        }
        Message::Assistant { content } => {
            let text = joined_text(content);
            let tool_calls: Vec<ChatToolCall> = content
                .iter()
                .filter_map(|c| match c {
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => Some(ChatToolCall {
                        id: id.clone(),
                        call_type: "function",
                        function: ChatFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(arguments).unwrap_or_default(),
                        },
                    }),
                    _ => None,
                })
                .collect();

            ChatMessage {
                role: "assistant",
                content: (!text.is_empty()).then_some(MessageContent::Text(text)),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            }
        }
        Message::ToolResult {
            tool_call_id,
            content,
            ..
        } => ChatMessage {
            role: "tool",
            content: Some(MessageContent::Text(joined_text(content))),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.clone()),
        },
    }
}

/// Parse accumulated tool arguments. Weak providers sometimes emit invalid
/// JSON; the raw text is passed on as a string so the caller can repair it.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = StreamEvent> {
    stream! {
        // (id, name, arguments) per tool-call index
        let mut tool_calls: Vec<(String, String, String)> = Vec::new();
        let mut finish_reason: Option<String> = None;
        let mut usage = Usage::default();

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    let chunk: StreamChunk = match serde_json::from_str(&msg.data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            yield StreamEvent::Error {
                                message: format!("Failed to parse chunk: {}", e),
                            };
                            event_source.close();
                            return;
                        }
                    };

                    if let Some(err) = chunk.error {
                        yield StreamEvent::Error { message: err.message };
                        event_source.close();
                        return;
                    }

                    for choice in &chunk.choices {
                        let reasoning = choice
                            .delta
                            .reasoning
                            .as_ref()
                            .or(choice.delta.reasoning_content.as_ref());
                        if let Some(delta) = reasoning.filter(|d| !d.is_empty()) {
                            yield StreamEvent::ThinkingDelta { delta: delta.clone() };
                        }

                        if let Some(delta) = choice.delta.content.as_ref().filter(|d| !d.is_empty()) {
                            yield StreamEvent::TextDelta { delta: delta.clone() };
                        }

                        if let Some(ref tcs) = choice.delta.tool_calls {
                            for tc in tcs {
                                let idx = tc.index;
                                while tool_calls.len() <= idx {
                                    tool_calls.push((String::new(), String::new(), String::new()));
                                }
                                if let Some(ref id) = tc.id {
                                    tool_calls[idx].0 = id.clone();
                                }
                                if let Some(ref function) = tc.function {
                                    if let Some(ref name) = function.name {
                                        tool_calls[idx].1.push_str(name);
                                    }
                                    if let Some(ref args) = function.arguments {
                                        tool_calls[idx].2.push_str(args);
                                    }
                                }
                            }
                        }

                        if let Some(ref reason) = choice.finish_reason {
                            finish_reason = Some(reason.clone());
                        }
                    }

                    if let Some(ref stream_usage) = chunk.usage {
                        usage.input = stream_usage.prompt_tokens;
                        usage.output = stream_usage.completion_tokens;
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let body = response.text().await.unwrap_or_default();
                    yield StreamEvent::Error {
                        message: Error::api(status.as_u16(), extract_error_message(&body)).to_string(),
                    };
                    event_source.close();
                    return;
                }
                Err(e) => {
                    yield StreamEvent::Error {
                        message: format!("SSE error: {}", e),
                    };
                    event_source.close();
                    return;
                }
            }
        }
        event_source.close();

        for (index, (id, name, args)) in tool_calls.into_iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            // Some gateways omit call ids entirely
            let id = if id.is_empty() { format!("call_{}", index) } else { id };
            yield StreamEvent::ToolCall {
                id,
                name,
                arguments: parse_arguments(&args),
            };
        }

        let stop_reason = finish_reason
            .as_deref()
            .and_then(StopReason::from_finish_reason)
            .unwrap_or(StopReason::Stop);

        yield StreamEvent::Finish { stop_reason, usage };
    }
}

/// Pull `error.message` out of an OpenAI-style error body, falling back to the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string())
}

// Request types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: ChatFunctionCall,
}

#[derive(Debug, Serialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}
