//! tether-agent: agent runtime for tether
//!
//! The turn loop that streams model steps and runs the tools they request,
//! the approval gateway gating risky tools, the context budget and its
//! summarizing compaction, and the compatibility layer that repairs tool
//! arguments from providers that format them loosely.

pub mod agent;
pub mod approval;
pub mod compat;
pub mod context;
pub mod draft;
pub mod error;
pub mod events;
pub mod prompt;
pub mod registry;
pub mod runs;
pub mod safety;
pub mod store;
pub mod tool;
pub mod transport;

pub use agent::{AgentConfig, AgentLoop, TurnOutcome};
pub use approval::{ApprovalGateway, ApprovalTicket, PendingApproval};
pub use context::{CompactionConfig, CompactionReason, ContextManager};
pub use draft::DraftMessage;
pub use error::{Error, Result};
pub use events::{AgentEvent, TurnStatus};
pub use prompt::{Skill, SystemPrompt};
pub use registry::ToolRegistry;
pub use runs::RunSnapshot;
pub use safety::SafetyFilter;
pub use store::{
    Attachment, ChatMessage, Conversation, ConversationStore, InMemoryStore, Role, ToolCallRecord,
    ToolCallStatus,
};
pub use tool::{BoxedTool, RiskTier, Tool, ToolResult};
pub use transport::{ProviderTransport, RetryConfig, StreamRequest, Transport};
