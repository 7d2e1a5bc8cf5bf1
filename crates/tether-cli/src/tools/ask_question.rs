//! `ask_question` tool: multiple-choice questions for the user.
//!
//! Turn-stopping: the tool only records the questions, and the user's answer
//! arrives as the next message of the conversation.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tether_agent::tool::{Tool, ToolResult};
use tokio_util::sync::CancellationToken;

const MAX_QUESTIONS: usize = 5;

/// Keys less careful models use for the option list
const OPTION_KEYS: &[&str] = &["options", "choices", "answers"];
/// Keys used for the multi-select flag
const MULTI_KEYS: &[&str] = &["allow_multiple", "allowMultiple", "multiSelect", "multi_select", "multiple"];

pub struct AskQuestionTool;

impl AskQuestionTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AskQuestionTool {
    fn default() -> Self {
        Self::new()
    }
}

fn repair_option(index: usize, option: &Value) -> Option<Value> {
    let id = format!("opt_{}", index + 1);
    match option {
        Value::String(label) => Some(json!({ "id": id, "label": label })),
        Value::Number(n) => Some(json!({ "id": id, "label": n.to_string() })),
        Value::Object(object) => {
            let label = ["label", "text", "value", "title"]
                .iter()
                .find_map(|key| object.get(*key)?.as_str())?;
            let id = object
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or(id);
            let mut repaired = json!({ "id": id, "label": label });
            if let Some(description) = object.get("description").and_then(Value::as_str) {
                repaired["description"] = json!(description);
            }
            Some(repaired)
        }
        _ => None,
    }
}

fn repair_question(index: usize, question: &Value) -> Option<Value> {
    let object = question.as_object()?;
    let text = ["question", "text", "prompt", "title"]
        .iter()
        .find_map(|key| object.get(*key)?.as_str())?;
    let options = OPTION_KEYS
        .iter()
        .find_map(|key| object.get(*key)?.as_array())?
        .iter()
        .enumerate()
        .map(|(i, option)| repair_option(i, option))
        .collect::<Option<Vec<_>>>()?;

    let allow_multiple = MULTI_KEYS
        .iter()
        .find_map(|key| match object.get(*key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => Some(s == "true" || s == "multi" || s == "multiple"),
            _ => None,
        })
        .or_else(|| object.get("mode").and_then(Value::as_str).map(|m| m == "multi"))
        .unwrap_or(false);

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("q_{}", index + 1));

    Some(json!({
        "id": id,
        "question": text,
        "options": options,
        "allow_multiple": allow_multiple,
    }))
}

#[async_trait]
impl Tool for AskQuestionTool {
    fn name(&self) -> &str {
        "ask_question"
    }

    fn description(&self) -> &str {
        "Ask the user one or more multiple-choice questions. Use it to clarify requirements or let the user pick between options. \
The user's answer arrives as their next message, so do not write anything after calling this tool."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": MAX_QUESTIONS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "question": { "type": "string" },
                            "options": {
                                "type": "array",
                                "minItems": 2,
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "id": { "type": "string" },
                                        "label": { "type": "string" },
                                        "description": { "type": "string" }
                                    },
                                    "required": ["id", "label"]
                                }
                            },
                            "allow_multiple": { "type": "boolean" }
                        },
                        "required": ["id", "question", "options"]
                    }
                },
                "context": {
                    "type": "string",
                    "description": "Why you are asking"
                }
            },
            "required": ["questions"]
        })
    }

    /// Accepts a singular `question` with flat string options, missing ids,
    /// and the various spellings of the multi-select flag.
    fn repair(&self, arguments: &Value) -> Option<Value> {
        let object = arguments.as_object()?;

        let questions: Vec<Value> = match object.get("questions") {
            Some(Value::Array(list)) => list.clone(),
            Some(single @ Value::Object(_)) => vec![single.clone()],
            _ => vec![Value::Object(object.clone())],
        };

        let repaired = questions
            .iter()
            .enumerate()
            .map(|(i, q)| repair_question(i, q))
            .collect::<Option<Vec<_>>>()?;

        let mut result = Map::new();
        result.insert("questions".into(), Value::Array(repaired));
        if let Some(context) = object.get("context").and_then(Value::as_str) {
            result.insert("context".into(), json!(context));
        }
        Some(Value::Object(result))
    }

    fn ends_turn(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        _cancel: CancellationToken,
    ) -> ToolResult {
        let questions = arguments
            .get("questions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if questions.is_empty() {
            return ToolResult::error(
                "At least one question is required",
                "Pass questions as [{id, question, options:[{id, label}]}].",
            );
        }

        ToolResult::success(json!({
            "status": "awaiting_user",
            "questions": questions,
            "context": arguments.get("context"),
            "message": "The questions were shown to the user. Their answer will arrive as the next message.",
        }))
    }
}
