//! JSONL conversation store: one append-only file per conversation

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tether_agent::store::{ChatMessage, Conversation, ConversationStore, ToolCallRecord};
use tether_agent::{Error, Result};

/// Entry types for the JSONL format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEntry {
    /// Conversation header, always the first line
    Conversation {
        conversation: Conversation,
        model: String,
    },
    /// A message without its tool calls
    Message { message: ChatMessage },
    /// A tool call belonging to an earlier message
    ToolCall {
        message_id: String,
        tool_call: ToolCallRecord,
    },
}

/// Summary of a stored conversation
#[derive(Debug, Clone)]
pub struct ConversationInfo {
    pub conversation: Conversation,
    pub model: String,
    pub message_count: usize,
}

impl ConversationInfo {
    pub fn created_at_display(&self) -> String {
        self.conversation
            .created_at
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }
}

/// Conversation store writing JSONL files under a directory
pub struct JsonlStore {
    dir: PathBuf,
    model: String,
    /// message id -> (conversation id, tool calls not yet written), for
    /// routing tool calls; an entry goes away with its last call
    owners: Mutex<HashMap<String, (String, usize)>>,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            model: model.into(),
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, conversation_id: &str) -> Result<PathBuf> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Store(format!(
                "Invalid conversation id: {:?}",
                conversation_id
            )));
        }
        Ok(self.dir.join(format!("{}.jsonl", conversation_id)))
    }

    fn append(&self, conversation_id: &str, entry: &StoreEntry) -> Result<()> {
        let path = self.path(conversation_id)?;
        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&self.dir)?;
            let is_new = !path.exists();
            let mut file = File::options().create(true).append(true).open(&path)?;
            if is_new {
                let header = StoreEntry::Conversation {
                    conversation: Conversation::new(conversation_id),
                    model: self.model.clone(),
                };
                writeln!(file, "{}", serde_json::to_string(&header)?)?;
            }
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
            file.flush()
        };
        write().map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))
    }

    fn read_entries(path: &Path) -> std::io::Result<Vec<StoreEntry>> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    "Skipping unreadable line {} in {}: {}",
                    index + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    /// All stored conversations, newest first
    pub fn list_conversations(&self) -> std::io::Result<Vec<ConversationInfo>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut conversations = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(entries) = Self::read_entries(&path) else {
                continue;
            };
            let message_count = entries
                .iter()
                .filter(|e| matches!(e, StoreEntry::Message { .. }))
                .count();
            if let Some(StoreEntry::Conversation {
                conversation,
                model,
            }) = entries.into_iter().next()
            {
                conversations.push(ConversationInfo {
                    conversation,
                    model,
                    message_count,
                });
            }
        }

        conversations.sort_by(|a, b| b.conversation.created_at.cmp(&a.conversation.created_at));
        Ok(conversations)
    }
}

#[async_trait]
impl ConversationStore for JsonlStore {
    async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        let mut stored = message.clone();
        stored.tool_calls.clear();
        self.append(
            &message.conversation_id,
            &StoreEntry::Message { message: stored },
        )?;
        if !message.tool_calls.is_empty() {
            self.owners.lock().insert(
                message.id.clone(),
                (message.conversation_id.clone(), message.tool_calls.len()),
            );
        }
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let path = self.path(conversation_id)?;
        if !path.exists() {
            return Ok(vec![]);
        }
        let entries = Self::read_entries(&path)
            .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?;

        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut tool_calls: HashMap<String, Vec<ToolCallRecord>> = HashMap::new();
        for entry in entries {
            match entry {
                StoreEntry::Conversation { .. } => {}
                StoreEntry::Message { message } => messages.push(message),
                StoreEntry::ToolCall {
                    message_id,
                    tool_call,
                } => tool_calls.entry(message_id).or_default().push(tool_call),
            }
        }

        for message in &mut messages {
            if let Some(calls) = tool_calls.remove(&message.id) {
                message.tool_calls = calls;
            }
        }
        Ok(messages)
    }

    async fn create_tool_call(&self, message_id: &str, call: &ToolCallRecord) -> Result<()> {
        let conversation_id = {
            let mut owners = self.owners.lock();
            let Some((conversation_id, remaining)) = owners.get_mut(message_id) else {
                return Err(Error::Store(format!("Unknown message id: {}", message_id)));
            };
            let conversation_id = conversation_id.clone();
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                owners.remove(message_id);
            }
            conversation_id
        };
        self.append(
            &conversation_id,
            &StoreEntry::ToolCall {
                message_id: message_id.to_string(),
                tool_call: call.clone(),
            },
        )
    }
}
