//! Error types for tether-ai

use thiserror::Error;

/// Result type alias using tether-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to an LLM provider
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),
}

/// Lower-cased fragments providers use when a prompt does not fit the model.
const OVERFLOW_FRAGMENTS: &[&str] = &[
    "too many tokens",
    "context length",
    "context window",
    "context_length_exceeded",
    "token limit",
    "prompt is too long",
    "prompt too long",
    "input too long",
    "request too large",
    "messages too long",
    "reduce the length",
    "maximum length",
    "content too large",
];

impl Error {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } | Error::Sse(_) => true,
            Error::Api { status, message } => {
                if self.is_context_overflow() {
                    return false;
                }
                let msg = message.to_lowercase();
                *status == 429
                    || *status == 529
                    || (500..600).contains(status)
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
            }
            _ => false,
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Api { status, message } => {
                let msg = message.to_lowercase();
                *status == 413 || OVERFLOW_FRAGMENTS.iter().any(|f| msg.contains(f))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_typed_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Sse("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_retryable_api_statuses() {
        assert!(Error::api(429, "slow down").is_retryable());
        assert!(Error::api(503, "unavailable").is_retryable());
        assert!(Error::api(400, "API is overloaded right now").is_retryable());
    }

    #[test]
    fn test_not_retryable_auth_or_overflow() {
        assert!(!Error::api(401, "Invalid API key").is_retryable());
        assert!(!Error::api(400, "This model's maximum context length is 8192 tokens").is_retryable());
        assert!(!Error::InvalidApiKey.is_retryable());
        assert!(!Error::Aborted.is_retryable());
    }

    #[test]
    fn test_overflow_typed_variant() {
        assert!(Error::ContextOverflow("too big".into()).is_context_overflow());
    }

    #[test]
    fn test_overflow_api_messages() {
        assert!(Error::api(400, "Too many tokens in the request").is_context_overflow());
        assert!(Error::api(400, "Prompt is too long for this model").is_context_overflow());
        assert!(Error::api(400, "context_length_exceeded").is_context_overflow());
        assert!(Error::api(400, "Input exceeds the maximum length").is_context_overflow());
        assert!(Error::api(413, "Payload Too Large").is_context_overflow());
    }

    #[test]
    fn test_not_overflow() {
        assert!(!Error::api(401, "Invalid API key").is_context_overflow());
        assert!(!Error::InvalidApiKey.is_context_overflow());
        assert!(!Error::RateLimited { retry_after: None }.is_context_overflow());
    }
}
