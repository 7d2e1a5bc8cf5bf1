//! Persisted conversation records and the store the agent loop writes to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_ai::{Content, Message};

use crate::error::Result;
use crate::tool::ToolResult;

/// Conversation header; messages are looked up by its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pinned: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Success,
    Error,
}

/// A tool call requested by the model during one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub status: ToolCallStatus,
}

impl ToolCallRecord {
    pub fn pending(id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            input,
            output: None,
            status: ToolCallStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ToolCallStatus::Pending
    }

    /// Record the result. Status only moves out of `Pending`; returns false
    /// (and changes nothing) if the call already completed.
    pub fn complete(&mut self, result: &ToolResult) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = if result.is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Success
        };
        self.output = Some(result.payload.clone());
        true
    }
}

/// File attached to a user message, base64-encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn new(conversation_id: &str, role: Role, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content,
            thinking: None,
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(
        conversation_id: &str,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            attachments,
            ..Self::new(conversation_id, Role::User, content.into())
        }
    }

    pub fn assistant(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, content.into())
    }

    pub fn system(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::System, content.into())
    }

    /// Expand into provider messages. An assistant message with tool calls
    /// becomes the assistant turn followed by one tool result per call.
    pub fn to_model_messages(&self) -> Vec<Message> {
        match self.role {
            Role::System => vec![Message::system(&self.content)],
            Role::User => {
                let mut content = Vec::new();
                if !self.content.is_empty() {
                    content.push(Content::text(&self.content));
                }
                for attachment in &self.attachments {
                    if attachment.is_image() {
                        content.push(Content::image(&attachment.data, &attachment.mime_type));
                    } else {
                        content.push(Content::text(format!("[Attached file: {}]", attachment.name)));
                    }
                }
                vec![Message::User { content }]
            }
            Role::Assistant => {
                let mut content = Vec::new();
                if !self.content.is_empty() {
                    content.push(Content::text(&self.content));
                }
                for call in &self.tool_calls {
                    content.push(Content::tool_call(&call.id, &call.tool_name, call.input.clone()));
                }

                let mut messages = vec![Message::Assistant { content }];
                for call in &self.tool_calls {
                    let output = call.output.clone().unwrap_or_else(|| {
                        json!({ "error": true, "message": "No result was recorded for this call" })
                    });
                    messages.push(Message::tool_result(
                        &call.id,
                        &call.tool_name,
                        output.to_string(),
                        call.status != ToolCallStatus::Success,
                    ));
                }
                messages
            }
        }
    }
}

/// Expand a stored history for the provider
pub fn to_model_messages(history: &[ChatMessage]) -> Vec<Message> {
    history.iter().flat_map(ChatMessage::to_model_messages).collect()
}

/// The persistence operations the agent loop needs
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist a message. Its tool calls are persisted separately.
    async fn create_message(&self, message: &ChatMessage) -> Result<()>;

    /// All messages of a conversation in creation order, tool calls attached
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;

    /// Persist a tool call belonging to `message_id`
    async fn create_tool_call(&self, message_id: &str, call: &ToolCallRecord) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    messages: Vec<ChatMessage>,
    tool_calls: HashMap<String, Vec<ToolCallRecord>>,
}

/// Store kept in process memory
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        let mut stored = message.clone();
        stored.tool_calls.clear();
        self.state.lock().messages.push(stored);
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| {
                let mut message = m.clone();
                message.tool_calls = state.tool_calls.get(&m.id).cloned().unwrap_or_default();
                message
            })
            .collect())
    }

    async fn create_tool_call(&self, message_id: &str, call: &ToolCallRecord) -> Result<()> {
        self.state
            .lock()
            .tool_calls
            .entry(message_id.to_string())
            .or_default()
            .push(call.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_status_is_monotonic() {
        let mut call = ToolCallRecord::pending("c1", "bash", json!({"command": "ls"}));
        assert!(call.complete(&ToolResult::text("ok")));
        assert_eq!(call.status, ToolCallStatus::Success);
        assert!(!call.complete(&ToolResult::error("late", "")));
        assert_eq!(call.status, ToolCallStatus::Success);
        assert_eq!(call.output.unwrap()["output"], "ok");
    }

    #[test]
    fn test_assistant_expansion_pairs_results() {
        let mut msg = ChatMessage::assistant("conv", "Done.");
        let mut call = ToolCallRecord::pending("c1", "list_directory", json!({"path": "~"}));
        call.complete(&ToolResult::text("a\nb"));
        msg.tool_calls.push(call);
        let mut denied = ToolCallRecord::pending("c2", "bash", json!({"command": "rm x"}));
        denied.complete(&ToolResult::denied("bash", "timed out"));
        msg.tool_calls.push(denied);

        let expanded = msg.to_model_messages();
        assert_eq!(expanded.len(), 3);
        assert_eq!(expanded[0].tool_calls().len(), 2);
        match &expanded[2] {
            Message::ToolResult { tool_call_id, is_error, .. } => {
                assert_eq!(tool_call_id, "c2");
                assert!(*is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_user_attachments_expand() {
        let msg = ChatMessage::user(
            "conv",
            "what is this?",
            vec![
                Attachment {
                    name: "shot.png".into(),
                    mime_type: "image/png".into(),
                    data: "aGk=".into(),
                },
                Attachment {
                    name: "notes.pdf".into(),
                    mime_type: "application/pdf".into(),
                    data: "aGk=".into(),
                },
            ],
        );
        let expanded = msg.to_model_messages();
        assert_eq!(expanded.len(), 1);
        let content = expanded[0].content();
        assert_eq!(content.len(), 3);
        assert!(matches!(content[1], Content::Image { .. }));
        assert_eq!(content[2].as_text(), Some("[Attached file: notes.pdf]"));
    }

    #[tokio::test]
    async fn test_in_memory_store_attaches_tool_calls() {
        let store = InMemoryStore::new();
        let user = ChatMessage::user("a", "hi", vec![]);
        store.create_message(&user).await.unwrap();
        store
            .create_message(&ChatMessage::user("b", "other conversation", vec![]))
            .await
            .unwrap();

        let assistant = ChatMessage::assistant("a", "hello");
        store.create_message(&assistant).await.unwrap();
        let call = ToolCallRecord::pending("c1", "read_file", json!({"path": "/x"}));
        store.create_tool_call(&assistant.id, &call).await.unwrap();

        let messages = store.get_messages("a").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].tool_calls, vec![call]);
    }
}
