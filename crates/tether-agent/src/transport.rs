//! Streaming endpoint abstraction.
//!
//! A transport runs exactly one generation step. The agent loop owns the
//! step loop, tool execution, and tool results.

use std::{sync::Arc, sync::LazyLock, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tether_ai::providers::openai::OpenAIProvider;
use tether_ai::{Context, Message, StreamEvent, StreamEventStream, ToolDefinition};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Check if a stream error message describes a transient failure
pub fn is_retryable_error(error: &str) -> bool {
    if is_context_overflow(error) {
        return false;
    }
    let lower = error.to_lowercase();
    ["429", "500", "502", "503", "504", "529"]
        .iter()
        .any(|code| error.contains(code))
        || ["rate limit", "timeout", "timed out", "connection", "overloaded"]
            .iter()
            .any(|kw| lower.contains(kw))
}

/// Context overflow signatures across providers
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // context length / window / size
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)context.?(size|limit).?(exceed|reach)",
        r"(?i)context_length_exceeded",
        r"(?i)(slot.?)?context.?overflow",
        r"(?i)n_ctx",
        // token limits
        r"(?i)too.?many.?tokens",
        r"(?i)token.?limit",
        r"(?i)total.?tokens?.?exceed",
        r"(?i)maximum.?number.?of.?tokens",
        r"(?i)max_prompt_tokens",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        // too long / too large
        r"(?i)(prompt|input|messages?|sequence|request).?(is.?)?too.?(long|large)",
        r"(?i)content.?too.?large",
        r"(?i)maximum.?length",
        r"(?i)reduce.?the.?length",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// HTTP 400 references; only an overflow when token language accompanies them
static HTTP_400_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status|http|error)[:\s(]*400\b|\b400\s+bad\s+request").ok()
});

/// Check if an error indicates a context overflow / too many tokens
pub fn is_context_overflow(error: &str) -> bool {
    if HTTP_400_PATTERN.as_ref().is_some_and(|re| re.is_match(error)) {
        let lower = error.to_lowercase();
        if lower.contains("token") || lower.contains("context") || lower.contains("length") {
            return true;
        }
    }

    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}

/// Inputs for one generation step
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

impl From<StreamRequest> for Context {
    fn from(request: StreamRequest) -> Self {
        Context {
            model: request.model,
            system_prompt: request.system_prompt,
            messages: request.messages,
            tools: request.tools,
            max_tokens: request.max_tokens,
        }
    }
}

/// The LLM streaming endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start one generation step. Failures after the stream opens arrive as
    /// a terminal `StreamEvent::Error`.
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<StreamEventStream>;
}

/// Transport calling an OpenAI-compatible endpoint directly
pub struct ProviderTransport {
    provider: Arc<OpenAIProvider>,
    retry_config: RetryConfig,
}

impl ProviderTransport {
    pub fn new(provider: OpenAIProvider) -> Self {
        Self {
            provider: Arc::new(provider),
            retry_config: RetryConfig::default(),
        }
    }

    /// Set retry configuration
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }
}

#[async_trait]
impl Transport for ProviderTransport {
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<StreamEventStream> {
        let context = Context::from(request);
        let mut attempt = 0u32;

        // Failures before the first event are retried and returned as errors.
        // Once output has arrived the stream is passed through as-is.
        let (mut events, first) = loop {
            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let failure = match self.provider.stream(&context).await {
                Ok(mut events) => match events.next().await {
                    Some(StreamEvent::Error { message }) => Error::from_stream_message(message),
                    first => break (events, first),
                },
                Err(e) => Error::from(e),
            };

            if attempt >= self.retry_config.max_retries || !failure.is_retryable() {
                return Err(failure);
            }

            let delay = self.retry_config.delay_for_attempt(attempt);
            tracing::warn!(
                "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                attempt + 1,
                self.retry_config.max_retries + 1,
                failure,
                delay
            );
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let event_stream: StreamEventStream = Box::pin(stream! {
            if let Some(event) = first {
                yield event;
            }
            while let Some(event) = events.next().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        });

        Ok(event_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_provider_messages() {
        for message in [
            "prompt is too long: 210000 tokens > 200000 maximum",
            "request too large",
            "messages too long",
            "This model's maximum context length is 128000 tokens. context_length_exceeded",
            "Please reduce the length of the messages",
            "max_tokens exceeds the model limit",
            "Request exceeds the token limit for this model",
            "Input token limit exceeded",
            "too many tokens in the request",
            "context window exceeded",
            "n_ctx exceeded, cannot process",
            "slot context overflow",
            "context size exceeded",
            "sequence too long for model",
            "total tokens exceed the limit",
            "input exceeds maximum length",
            "HTTP 413 Payload Too Large",
        ] {
            assert!(is_context_overflow(message), "expected overflow: {message}");
        }
    }

    #[test]
    fn test_overflow_http_400_with_token_language() {
        assert!(is_context_overflow("HTTP 400: token count exceeds limit"));
        assert!(is_context_overflow("400 Bad Request: context too large"));
        assert!(is_context_overflow("API error (400): input length exceeds"));
    }

    #[test]
    fn test_not_overflow() {
        for message in [
            "401 Unauthorized",
            "rate limit exceeded",
            "internal server error 500",
            "connection timeout",
            "invalid API key",
            "max_tokens parameter must be positive",
            "400 Bad Request: invalid field",
            "connected to port 14001 with token auth",
            "processed 400 items in context manager",
        ] {
            assert!(!is_context_overflow(message), "unexpected overflow: {message}");
        }
    }

    #[test]
    fn test_retryable_messages() {
        assert!(is_retryable_error("API error (503): unavailable"));
        assert!(is_retryable_error("API error (429): slow down"));
        assert!(is_retryable_error("Model is overloaded"));
        assert!(!is_retryable_error("API error (401): bad key"));
        assert!(!is_retryable_error("API error (400): prompt is too long"));
    }

    #[test]
    fn test_retry_delay_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn test_request_into_context() {
        let request = StreamRequest {
            model: "gpt-4o".into(),
            system_prompt: Some("sys".into()),
            messages: vec![Message::user("hi")],
            tools: vec![],
            max_tokens: Some(100),
        };
        let context = Context::from(request);
        assert_eq!(context.model, "gpt-4o");
        assert_eq!(context.messages.len(), 1);
        assert_eq!(context.max_tokens, Some(100));
    }

    #[tokio::test]
    async fn test_provider_failure_before_stream_is_typed_error() {
        // Nothing listens on port 1, so the request fails before any event
        let provider = OpenAIProvider::new("test-key").with_base_url("http://127.0.0.1:1/v1");
        let transport = ProviderTransport::new(provider).with_retry_config(RetryConfig::none());

        let result = transport
            .stream(
                StreamRequest {
                    model: "gpt-4o".into(),
                    messages: vec![Message::user("hi")],
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await;
        let Err(err) = result else {
            panic!("expected the request to fail");
        };
        assert!(!err.is_context_overflow());
        assert!(!matches!(err, Error::Aborted));
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let transport = ProviderTransport::new(OpenAIProvider::new("test-key"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = transport.stream(StreamRequest::default(), cancel).await;
        assert!(matches!(result, Err(Error::Aborted)));
    }
}
