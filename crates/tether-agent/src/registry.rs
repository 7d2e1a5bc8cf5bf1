//! The set of callable tools, their compiled schemas, and the safety filter.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::compat;
use crate::error::{Error, Result};
use crate::safety::SafetyFilter;
use crate::tool::{BoxedTool, RiskTier, ToolResult, to_definition};

/// A tool call whose arguments passed normalization, validation and the
/// safety filter, ready for approval and execution
#[derive(Clone)]
pub struct PreparedCall {
    pub tool: BoxedTool,
    pub arguments: Value,
}

impl PreparedCall {
    pub fn tier(&self) -> RiskTier {
        self.tool.tier()
    }
}

impl std::fmt::Debug for PreparedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedCall")
            .field("tool", &self.tool.name())
            .field("arguments", &self.arguments)
            .finish()
    }
}

/// Registry of tools available to the model
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
    safety: SafetyFilter,
}

impl ToolRegistry {
    /// Create an empty registry with the built-in deny-list
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the safety filter
    pub fn with_safety_filter(mut self, safety: SafetyFilter) -> Self {
        self.safety = safety;
        self
    }

    /// Add a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: BoxedTool) {
        self.tools.retain(|t| t.name() != tool.name());
        self.cache_tool_schema(&tool);
        self.tools.push(tool);
    }

    /// Builder-style `register`
    pub fn with_tool(mut self, tool: BoxedTool) -> Self {
        self.register(tool);
        self
    }

    /// Compile and cache the JSON schema validator for a tool.
    fn cache_tool_schema(&mut self, tool: &BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
                self.schema_cache.remove(tool.name());
            }
        }
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Definitions advertised to the model
    pub fn definitions(&self) -> Vec<tether_ai::ToolDefinition> {
        self.tools.iter().map(|t| to_definition(t.as_ref())).collect()
    }

    pub fn safety_filter(&self) -> &SafetyFilter {
        &self.safety
    }

    /// Resolve, normalize, validate/repair and safety-check a raw call
    pub fn prepare(&self, name: &str, raw_arguments: Value) -> Result<PreparedCall> {
        let tool = self.get(name).cloned().ok_or_else(|| Error::ToolValidation {
            tool: name.to_string(),
            message: format!("Unknown tool. Available tools: {}", self.names().join(", ")),
        })?;

        let validator = self.schema_cache.get(name).map(Arc::as_ref);
        let arguments = compat::prepare_arguments(tool.as_ref(), validator, raw_arguments)?;

        if let Some(path) = tool.read_target(&arguments) {
            if let Some(rule) = self.safety.check(&path) {
                tracing::warn!(tool = name, path = %path, rule = %rule, "Blocked read of sensitive path");
                return Err(Error::SecurityRestriction(path));
            }
        }

        Ok(PreparedCall { tool, arguments })
    }

    /// Run a prepared call. A tool that panics yields an error result
    /// instead of taking the turn down with it.
    pub async fn execute(
        &self,
        call: &PreparedCall,
        tool_call_id: &str,
        cancel: CancellationToken,
    ) -> ToolResult {
        tracing::debug!(tool = call.tool.name(), id = tool_call_id, "Executing tool");
        let outcome = AssertUnwindSafe(call.tool.execute(tool_call_id, call.arguments.clone(), cancel))
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(tool = call.tool.name(), panic = %message, "Tool panicked during execution");
                error_result(&Error::ToolExecution {
                    tool: call.tool.name().to_string(),
                    message,
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Render a preparation or execution error as data for the model
pub fn error_result(err: &Error) -> ToolResult {
    match err {
        Error::SecurityRestriction(path) => ToolResult::restricted(path),
        Error::ApprovalDenied(tool) => {
            ToolResult::denied(tool, "the request was denied, timed out, or superseded")
        }
        Error::Aborted => ToolResult::cancelled(),
        Error::ToolValidation { tool, message } => ToolResult::error(
            format!("Invalid arguments for '{}': {}", tool, message),
            "Check the tool's parameter schema and call it again with corrected arguments.",
        ),
        Error::ToolExecution { .. } => ToolResult::error(
            err.to_string(),
            "The tool crashed. Try different arguments or another tool.",
        ),
        other => ToolResult::error(other.to_string(), "Try a different approach."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ReadTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::tool::Tool for ReadTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "Reads a file"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        fn read_target(&self, arguments: &Value) -> Option<String> {
            arguments.get("path")?.as_str().map(String::from)
        }
        async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::text("contents")
        }
    }

    struct CrashingTool;

    #[async_trait]
    impl crate::tool::Tool for CrashingTool {
        fn name(&self) -> &str {
            "crash"
        }
        fn description(&self) -> &str {
            "Always panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
            panic!("index out of bounds");
        }
    }

    fn registry(calls: Arc<AtomicUsize>) -> ToolRegistry {
        ToolRegistry::new().with_tool(Arc::new(ReadTool { calls }))
    }

    #[tokio::test]
    async fn test_prepare_and_execute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = registry(calls.clone());
        let call = reg
            .prepare("read_file", json!({"name": "read_file", "arguments": {"path": "/tmp/a.txt"}}))
            .unwrap();
        assert_eq!(call.arguments, json!({"path": "/tmp/a.txt"}));
        assert_eq!(call.tier(), RiskTier::Unclassified);
        let result = reg.execute(&call, "c1", CancellationToken::new()).await;
        assert!(!result.is_error);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_tool_becomes_error_result() {
        let reg = ToolRegistry::new().with_tool(Arc::new(CrashingTool));
        let call = reg.prepare("crash", json!({})).unwrap();
        let result = reg.execute(&call, "c1", CancellationToken::new()).await;
        assert!(result.is_error);
        let message = result.payload["message"].as_str().unwrap();
        assert!(message.contains("Tool 'crash' failed"));
        assert!(message.contains("index out of bounds"));
    }

    #[test]
    fn test_sensitive_path_restricted_before_io() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = registry(calls.clone());
        let err = reg
            .prepare("read_file", json!({"path": "/home/u/.ssh/id_rsa"}))
            .unwrap_err();
        assert!(matches!(err, Error::SecurityRestriction(_)));
        let result = error_result(&err);
        assert!(result.is_error);
        assert_eq!(result.payload["error"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(reg
            .prepare("read_file", json!({"path": "/home/u/project/myenvironment/readme.md"}))
            .is_ok());
    }

    #[test]
    fn test_unknown_tool() {
        let reg = registry(Arc::new(AtomicUsize::new(0)));
        let err = reg.prepare("nope", json!({})).unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut reg = registry(Arc::new(AtomicUsize::new(0)));
        reg.register(Arc::new(ReadTool {
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        assert_eq!(reg.names(), vec!["read_file"]);
        assert_eq!(reg.definitions().len(), 1);
    }
}
