//! Agent event types

use serde::{Deserialize, Serialize};

use crate::approval::PendingApproval;
use crate::context::CompactionReason;
use crate::draft::DraftMessage;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Aborted,
    Failed,
}

/// Events emitted during agent execution. Every event names the
/// conversation it belongs to, since turns of different conversations may
/// run at the same time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A turn started
    TurnStart { conversation_id: String },

    /// A model round trip started
    StepStart { conversation_id: String, step: u32 },

    /// The streaming draft changed
    DraftUpdated {
        conversation_id: String,
        draft: DraftMessage,
    },

    /// A tool call is about to be prepared and run
    ToolExecutionStart {
        conversation_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool call is waiting for the user
    ApprovalRequested {
        conversation_id: String,
        approval: PendingApproval,
    },

    /// Tool execution completed
    ToolExecutionEnd {
        conversation_id: String,
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },

    /// Context compaction started
    CompactionStart {
        conversation_id: String,
        reason: CompactionReason,
    },

    /// Context compaction completed
    CompactionEnd {
        conversation_id: String,
        tokens_before: u32,
        tokens_after: u32,
    },

    /// A turn ended
    TurnEnd {
        conversation_id: String,
        status: TurnStatus,
        error: Option<String>,
    },
}

impl AgentEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::TurnEnd { .. })
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            AgentEvent::TurnStart { conversation_id }
            | AgentEvent::StepStart { conversation_id, .. }
            | AgentEvent::DraftUpdated { conversation_id, .. }
            | AgentEvent::ToolExecutionStart { conversation_id, .. }
            | AgentEvent::ApprovalRequested { conversation_id, .. }
            | AgentEvent::ToolExecutionEnd { conversation_id, .. }
            | AgentEvent::CompactionStart { conversation_id, .. }
            | AgentEvent::CompactionEnd { conversation_id, .. }
            | AgentEvent::TurnEnd { conversation_id, .. } => conversation_id,
        }
    }
}
