//! Streaming event types

use crate::types::{StopReason, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted while a provider streams one generation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental assistant text
    TextDelta { delta: String },
    /// Incremental reasoning text
    ThinkingDelta { delta: String },
    /// A complete tool call request. Arguments are passed through as the
    /// provider produced them; repairing them is the caller's job.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// Generation finished
    Finish { stop_reason: StopReason, usage: Usage },
    /// Provider or transport failure; terminal
    Error { message: String },
}

impl StreamEvent {
    /// Check if this is a terminal event (Finish or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }
}

/// A stream of provider events
pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;
