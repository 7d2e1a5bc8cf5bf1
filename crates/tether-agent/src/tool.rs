//! Tool trait, risk tiers, and structured tool results

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Risk classification of a tool, governing whether approval is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Shell execution, navigation, typing, installs, logins
    Dangerous,
    /// Clicking and key presses in a browser
    Moderate,
    /// Read-only; never asks
    Unclassified,
}

impl RiskTier {
    /// Whether a human must approve calls of this tier
    pub fn requires_approval(self) -> bool {
        !matches!(self, RiskTier::Unclassified)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Dangerous => "dangerous",
            RiskTier::Moderate => "moderate",
            RiskTier::Unclassified => "unclassified",
        }
    }
}

/// Result of a tool execution, always returned as data to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the execution resulted in an error
    pub is_error: bool,
    /// Structured payload serialized back to the model
    pub payload: Value,
}

impl ToolResult {
    /// Successful result with a structured payload
    pub fn success(payload: Value) -> Self {
        Self {
            is_error: false,
            payload,
        }
    }

    /// Successful plain-text result
    pub fn text(output: impl Into<String>) -> Self {
        Self::success(json!({ "output": output.into() }))
    }

    /// Error result with a hint the model can act on
    pub fn error(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            is_error: true,
            payload: json!({
                "error": true,
                "message": message.into(),
                "suggestion": suggestion.into(),
            }),
        }
    }

    /// Rejected by the safety filter before any I/O
    pub fn restricted(path: &str) -> Self {
        Self {
            is_error: true,
            payload: json!({
                "error": true,
                "restricted": true,
                "message": format!("Access to '{}' is restricted because it may contain credentials or private data", path),
                "suggestion": "Do not retry this path. Ask the user to share the needed information directly if it is required.",
            }),
        }
    }

    /// The user (or the timeout) refused to let the call run
    pub fn denied(tool_name: &str, reason: &str) -> Self {
        Self {
            is_error: true,
            payload: json!({
                "error": true,
                "denied": true,
                "message": format!("The user did not approve running '{}' ({})", tool_name, reason),
                "suggestion": "Explain what you wanted to do and ask the user how to proceed, or choose a safer approach.",
            }),
        }
    }

    /// The run was stopped before this call finished
    pub fn cancelled() -> Self {
        Self {
            is_error: true,
            payload: json!({
                "error": true,
                "cancelled": true,
                "message": "The run was stopped before this tool call completed",
            }),
        }
    }

    /// Payload as the text sent back to the model
    pub fn to_model_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;

    /// Risk tier; read-only tools keep the default
    fn tier(&self) -> RiskTier {
        RiskTier::Unclassified
    }

    /// Coerce arguments that failed schema validation into the canonical
    /// shape. Only called after a validation failure.
    fn repair(&self, _arguments: &Value) -> Option<Value> {
        None
    }

    /// Path this call would read, for tools subject to the safety filter
    fn read_target(&self, _arguments: &Value) -> Option<String> {
        None
    }

    /// Whether a successful call hands control back to the user, ending the
    /// turn after the current step (e.g. asking the user a question)
    fn ends_turn(&self) -> bool {
        false
    }

    /// Execute the tool with validated arguments
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a Tool to the definition advertised to the model
pub fn to_definition(tool: &dyn Tool) -> tether_ai::ToolDefinition {
    tether_ai::ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } }
            })
        }
        async fn execute(&self, _id: &str, arguments: Value, _cancel: CancellationToken) -> ToolResult {
            let text = arguments
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("(empty)");
            ToolResult::text(text)
        }
    }

    #[tokio::test]
    async fn test_default_tier_and_hooks() {
        let tool = EchoTool;
        assert_eq!(tool.tier(), RiskTier::Unclassified);
        assert!(tool.repair(&json!({})).is_none());
        assert!(tool.read_target(&json!({"path": "/x"})).is_none());
        assert!(!tool.ends_turn());
        let result = tool
            .execute("c1", json!({"text": "hello"}), CancellationToken::new())
            .await;
        assert_eq!(result.payload["output"], "hello");
    }

    #[test]
    fn test_tier_approval() {
        assert!(RiskTier::Dangerous.requires_approval());
        assert!(RiskTier::Moderate.requires_approval());
        assert!(!RiskTier::Unclassified.requires_approval());
    }

    #[test]
    fn test_error_payloads_are_flagged() {
        assert_eq!(ToolResult::restricted("/x/.ssh/id_rsa").payload["error"], true);
        assert_eq!(ToolResult::denied("bash", "timed out").payload["denied"], true);
        assert_eq!(ToolResult::cancelled().payload["cancelled"], true);
        let err = ToolResult::error("boom", "try again");
        assert!(err.is_error);
        assert_eq!(err.payload["suggestion"], "try again");
    }

    #[test]
    fn test_to_definition() {
        let def = to_definition(&EchoTool);
        assert_eq!(def.name, "echo");
        assert_eq!(def.description, "Echoes input");
    }
}
