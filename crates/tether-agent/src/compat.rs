//! Tool-call argument normalization for providers with weak structured output.
//!
//! Runs ahead of schema validation: decodes string-encoded arguments, strips
//! `{name, parameters}` style envelopes, and on a validation failure gives the
//! tool one chance to repair the arguments before reporting the error back to
//! the model.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::tool::Tool;

/// Keys a provider may use to name the intended tool inside an envelope
const ENVELOPE_NAME_KEYS: &[&str] = &["function", "name", "tool", "tool_name", "toolName"];

/// Keys a provider may use to carry the real arguments inside an envelope
const ENVELOPE_ARGS_KEYS: &[&str] = &["parameters", "arguments", "args", "input", "params"];

/// Decode arguments that arrived as a JSON string; `null` becomes `{}`.
/// Strings that are not JSON are left alone so validation can report them.
pub fn decode_arguments(raw: Value) -> Value {
    match raw {
        Value::Null => Value::Object(Map::new()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Value::Object(Map::new());
            }
            serde_json::from_str(trimmed).unwrap_or(Value::String(s))
        }
        other => other,
    }
}

/// Unwrap a two-key envelope (`{"function": "x", "parameters": {...}}`) to the
/// inner object. Anything else is returned unchanged.
pub fn unwrap_envelope(args: Value) -> Value {
    let Value::Object(map) = &args else {
        return args;
    };
    if map.len() != 2 {
        return args;
    }

    let has_name = ENVELOPE_NAME_KEYS
        .iter()
        .any(|key| map.get(*key).is_some_and(Value::is_string));
    let inner = ENVELOPE_ARGS_KEYS
        .iter()
        .find_map(|key| map.get(*key).filter(|v| v.is_object()));

    match (has_name, inner) {
        (true, Some(inner)) => {
            tracing::debug!("Unwrapped tool-call argument envelope");
            inner.clone()
        }
        _ => args,
    }
}

/// Decode then unwrap; a no-op for well-formed arguments
pub fn normalize_tool_args(raw: Value) -> Value {
    unwrap_envelope(decode_arguments(raw))
}

/// Validate arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
pub fn validation_error(args: &Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("\n"))
    }
}

/// Normalize, validate, and if needed repair a tool call's arguments.
///
/// The tool's `repair` hook only runs after a first validation failure, and
/// its output must pass validation too. Tools without a compiled validator
/// accept normalized arguments as-is.
pub fn prepare_arguments(
    tool: &dyn Tool,
    validator: Option<&jsonschema::Validator>,
    raw: Value,
) -> Result<Value> {
    let args = normalize_tool_args(raw);
    let Some(validator) = validator else {
        return Ok(args);
    };

    let Some(first_error) = validation_error(&args, validator) else {
        return Ok(args);
    };

    let Some(repaired) = tool.repair(&args) else {
        return Err(Error::ToolValidation {
            tool: tool.name().to_string(),
            message: first_error,
        });
    };

    match validation_error(&repaired, validator) {
        None => {
            tracing::debug!(tool = tool.name(), "Repaired tool arguments");
            Ok(repaired)
        }
        Some(message) => Err(Error::ToolValidation {
            tool: tool.name().to_string(),
            message,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolResult;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_unwrap_function_parameters_envelope() {
        let raw = json!({"function": "X", "parameters": {"a": 1}});
        assert_eq!(normalize_tool_args(raw), json!({"a": 1}));
    }

    #[test]
    fn test_unwrap_other_key_spellings() {
        assert_eq!(
            normalize_tool_args(json!({"toolName": "bash", "input": {"command": "ls"}})),
            json!({"command": "ls"})
        );
        assert_eq!(
            normalize_tool_args(json!({"name": "read_file", "arguments": {"path": "/a"}})),
            json!({"path": "/a"})
        );
    }

    #[test]
    fn test_flat_object_unchanged() {
        let raw = json!({"path": "/tmp", "limit": 10});
        assert_eq!(normalize_tool_args(raw.clone()), raw);
    }

    #[test]
    fn test_two_keys_that_are_not_an_envelope() {
        // name is not a string
        let raw = json!({"name": 3, "parameters": {"a": 1}});
        assert_eq!(normalize_tool_args(raw.clone()), raw);
        // args is an array
        let raw = json!({"function": "X", "parameters": [1, 2]});
        assert_eq!(normalize_tool_args(raw.clone()), raw);
        // three keys
        let raw = json!({"function": "X", "parameters": {"a": 1}, "extra": true});
        assert_eq!(normalize_tool_args(raw.clone()), raw);
        // a real argument pair that happens to use a name key
        let raw = json!({"name": "Ada", "age": 36});
        assert_eq!(normalize_tool_args(raw.clone()), raw);
    }

    #[test]
    fn test_decode_string_and_null() {
        assert_eq!(decode_arguments(json!("{\"a\":1}")), json!({"a": 1}));
        assert_eq!(decode_arguments(Value::Null), json!({}));
        assert_eq!(decode_arguments(json!("")), json!({}));
        assert_eq!(decode_arguments(json!("not json")), json!("not json"));
        assert_eq!(
            normalize_tool_args(json!("{\"function\":\"X\",\"parameters\":{\"a\":1}}")),
            json!({"a": 1})
        );
    }

    struct RepairingTool;

    #[async_trait]
    impl Tool for RepairingTool {
        fn name(&self) -> &str {
            "count"
        }
        fn description(&self) -> &str {
            "Counts"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "n": { "type": "integer" } },
                "required": ["n"]
            })
        }
        fn repair(&self, arguments: &Value) -> Option<Value> {
            let n = arguments.get("number")?.as_str()?.parse::<i64>().ok()?;
            Some(json!({ "n": n }))
        }
        async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
            ToolResult::text("ok")
        }
    }

    fn validator() -> jsonschema::Validator {
        jsonschema::validator_for(&RepairingTool.parameters_schema()).unwrap()
    }

    #[test]
    fn test_valid_args_skip_repair() {
        let v = validator();
        let args = prepare_arguments(&RepairingTool, Some(&v), json!({"n": 2})).unwrap();
        assert_eq!(args, json!({"n": 2}));
    }

    #[test]
    fn test_invalid_args_repaired() {
        let v = validator();
        let args = prepare_arguments(&RepairingTool, Some(&v), json!({"number": "7"})).unwrap();
        assert_eq!(args, json!({"n": 7}));
    }

    #[test]
    fn test_unrepairable_args_error() {
        let v = validator();
        let err = prepare_arguments(&RepairingTool, Some(&v), json!({"number": "seven"})).unwrap_err();
        match err {
            Error::ToolValidation { tool, message } => {
                assert_eq!(tool, "count");
                assert!(message.contains("n"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_no_validator_passes_normalized() {
        let args = prepare_arguments(&RepairingTool, None, json!({"tool": "count", "args": {"x": 1}})).unwrap();
        assert_eq!(args, json!({"x": 1}));
    }
}
