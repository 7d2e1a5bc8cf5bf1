//! Error types for tether-agent

use thiserror::Error;

/// Result type alias using tether-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a turn.
///
/// Tool-level failures (validation, execution, restriction, denial) are
/// turned into `ToolResult` payloads for the model by
/// `registry::error_result` and never end a turn.
#[derive(Error, Debug)]
pub enum Error {
    /// The user stopped the run
    #[error("Run aborted")]
    Aborted,

    /// An error from the provider layer
    #[error(transparent)]
    Provider(#[from] tether_ai::Error),

    /// The provider stream failed with a message
    #[error("{0}")]
    Transport(String),

    /// The prompt did not fit the model's context window
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Tool arguments still did not match the schema after repair
    #[error("Invalid arguments for '{tool}': {message}")]
    ToolValidation { tool: String, message: String },

    /// A tool crashed while running
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The safety filter rejected a path
    #[error("Access to '{0}' is restricted")]
    SecurityRestriction(String),

    /// The user denied, ignored, or superseded an approval request
    #[error("Approval denied for '{0}'")]
    ApprovalDenied(String),

    /// The conversation store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Summarization failed during compaction
    #[error("Compaction error: {0}")]
    Compaction(String),
}

impl Error {
    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Provider(e) => e.is_context_overflow(),
            Error::Transport(message) => crate::transport::is_context_overflow(message),
            _ => false,
        }
    }

    /// Check if the failed request is worth sending again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider(e) => e.is_retryable(),
            Error::Transport(message) => crate::transport::is_retryable_error(message),
            _ => false,
        }
    }

    /// Classify a provider stream error message
    pub fn from_stream_message(message: String) -> Self {
        if crate::transport::is_context_overflow(&message) {
            Error::ContextOverflow(message)
        } else {
            Error::Transport(message)
        }
    }
}
