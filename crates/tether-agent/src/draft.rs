//! The assistant message being accumulated while a turn streams.

use serde::{Deserialize, Serialize};
use tether_ai::{Content, Message, StopReason, StreamEvent, Usage};

use crate::store::{ChatMessage, ToolCallRecord};
use crate::tool::ToolResult;

/// Streaming draft of the assistant message for one turn, across all steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftMessage {
    pub text: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
    #[serde(skip)]
    step_text: String,
    #[serde(skip)]
    step_first_call: usize,
}

impl DraftMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a new step
    pub fn begin_step(&mut self) {
        self.step_text.clear();
        self.step_first_call = self.tool_calls.len();
        self.stop_reason = None;
    }

    /// Fold one stream event into the draft. Returns whether anything
    /// visible changed.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::TextDelta { delta } => {
                if self.step_text.is_empty() && !self.text.is_empty() {
                    self.text.push_str("\n\n");
                }
                self.text.push_str(delta);
                self.step_text.push_str(delta);
                true
            }
            StreamEvent::ThinkingDelta { delta } => {
                self.thinking.push_str(delta);
                true
            }
            StreamEvent::ToolCall {
                id,
                name,
                arguments,
            } => {
                self.tool_calls
                    .push(ToolCallRecord::pending(id, name, arguments.clone()));
                true
            }
            StreamEvent::Finish { stop_reason, usage } => {
                self.stop_reason = Some(*stop_reason);
                self.usage.accumulate(usage);
                false
            }
            StreamEvent::Error { .. } => false,
        }
    }

    /// Tool calls requested in the current step
    pub fn step_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls[self.step_first_call.min(self.tool_calls.len())..]
    }

    /// The current step as a provider message, for the next step's history
    pub fn step_message(&self) -> Message {
        let mut content = Vec::new();
        if !self.step_text.is_empty() {
            content.push(Content::text(&self.step_text));
        }
        for call in self.step_calls() {
            content.push(Content::tool_call(&call.id, &call.tool_name, call.input.clone()));
        }
        Message::Assistant { content }
    }

    /// Record a tool result; ignored for unknown or completed calls
    pub fn complete_call(&mut self, tool_call_id: &str, result: &ToolResult) -> bool {
        self.tool_calls
            .iter_mut()
            .find(|c| c.id == tool_call_id)
            .is_some_and(|c| c.complete(result))
    }

    pub fn has_pending_calls(&self) -> bool {
        self.tool_calls.iter().any(ToolCallRecord::is_pending)
    }

    /// Resolve every pending call as cancelled
    pub fn cancel_pending(&mut self) {
        let cancelled = ToolResult::cancelled();
        for call in self.tool_calls.iter_mut().filter(|c| c.is_pending()) {
            call.complete(&cancelled);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.thinking.is_empty() && self.tool_calls.is_empty()
    }

    /// Build the message to persist
    pub fn to_chat_message(&self, conversation_id: &str) -> ChatMessage {
        let mut message = ChatMessage::assistant(conversation_id, &self.text);
        if !self.thinking.is_empty() {
            message.thinking = Some(self.thinking.clone());
        }
        message.tool_calls = self.tool_calls.clone();
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ToolCallStatus;
    use serde_json::json;

    fn text(delta: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            delta: delta.to_string(),
        }
    }

    #[test]
    fn test_text_accumulates_across_steps() {
        let mut draft = DraftMessage::new();
        draft.begin_step();
        draft.apply(&text("Looking"));
        draft.apply(&text(" now."));
        draft.begin_step();
        draft.apply(&text("Done."));
        assert_eq!(draft.text, "Looking now.\n\nDone.");
        assert_eq!(draft.step_message().text(), "Done.");
    }

    #[test]
    fn test_step_calls_and_completion() {
        let mut draft = DraftMessage::new();
        draft.begin_step();
        draft.apply(&StreamEvent::ToolCall {
            id: "c1".into(),
            name: "list_directory".into(),
            arguments: json!({"path": "~"}),
        });
        assert_eq!(draft.step_calls().len(), 1);
        assert_eq!(draft.step_message().tool_calls().len(), 1);

        assert!(draft.complete_call("c1", &ToolResult::text("a")));
        assert!(!draft.complete_call("c1", &ToolResult::text("b")));
        assert!(!draft.complete_call("missing", &ToolResult::text("b")));

        draft.begin_step();
        assert!(draft.step_calls().is_empty());
        assert_eq!(draft.tool_calls.len(), 1);
    }

    #[test]
    fn test_cancel_pending() {
        let mut draft = DraftMessage::new();
        draft.begin_step();
        for id in ["c1", "c2"] {
            draft.apply(&StreamEvent::ToolCall {
                id: id.into(),
                name: "bash".into(),
                arguments: json!({}),
            });
        }
        draft.complete_call("c1", &ToolResult::text("ok"));
        assert!(draft.has_pending_calls());
        draft.cancel_pending();
        assert!(!draft.has_pending_calls());
        assert_eq!(draft.tool_calls[0].status, ToolCallStatus::Success);
        assert_eq!(draft.tool_calls[1].status, ToolCallStatus::Error);
        assert_eq!(draft.tool_calls[1].output.as_ref().unwrap()["cancelled"], true);
    }

    #[test]
    fn test_finish_records_usage() {
        let mut draft = DraftMessage::new();
        assert!(draft.is_empty());
        let changed = draft.apply(&StreamEvent::Finish {
            stop_reason: StopReason::Stop,
            usage: Usage { input: 10, output: 5 },
        });
        assert!(!changed);
        assert_eq!(draft.usage.output, 5);
        assert_eq!(draft.stop_reason, Some(StopReason::Stop));
        assert!(draft.is_empty());

        let message = draft.to_chat_message("conv");
        assert_eq!(message.conversation_id, "conv");
        assert!(message.thinking.is_none());
    }
}
