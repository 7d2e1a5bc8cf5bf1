//! File reading tool

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_agent::tool::{Tool, ToolResult};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::config::expand_home;

const MAX_LINES: usize = 2000;
const MAX_LINE_LENGTH: usize = 2000;

/// Tool for reading file contents
pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReadFileTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a text file. For large files, use offset and limit parameters."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read (absolute, relative, or starting with ~)"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    fn read_target(&self, arguments: &Value) -> Option<String> {
        let path = arguments.get("path")?.as_str()?;
        Some(expand_home(path).display().to_string())
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let Some(path_str) = arguments.get("path").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'path' argument", "Pass the file path as 'path'.");
        };
        let path = expand_home(path_str);

        if cancel.is_cancelled() {
            return ToolResult::cancelled();
        }

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::error(
                    format!("Failed to read {}: {}", path.display(), e),
                    "Check the path with list_directory, or ask the user where the file is.",
                );
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        // 1-indexed on the wire
        let offset = arguments
            .get("offset")
            .and_then(Value::as_u64)
            .map(|o| (o as usize).saturating_sub(1))
            .unwrap_or(0);
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(MAX_LINES);

        if total_lines == 0 {
            return ToolResult::text("(empty file)");
        }
        if offset >= total_lines {
            return ToolResult::error(
                format!(
                    "Offset {} is beyond end of file ({} lines total)",
                    offset + 1,
                    total_lines
                ),
                "Read again with a smaller offset.",
            );
        }

        let end = (offset + limit).min(total_lines);
        let mut had_truncated = false;
        let formatted: Vec<String> = lines[offset..end]
            .iter()
            .map(|line| {
                if line.chars().count() > MAX_LINE_LENGTH {
                    had_truncated = true;
                    line.chars().take(MAX_LINE_LENGTH).collect()
                } else {
                    line.to_string()
                }
            })
            .collect();

        let mut output = formatted.join("\n");

        let mut notices = Vec::new();
        if had_truncated {
            notices.push(format!(
                "Some lines were truncated to {} characters",
                MAX_LINE_LENGTH
            ));
        }
        if end < total_lines {
            notices.push(format!(
                "{} more lines not shown. Use offset={} to continue reading",
                total_lines - end,
                end + 1
            ));
        }
        if !notices.is_empty() {
            output.push_str(&format!("\n\n... ({})", notices.join(". ")));
        }

        ToolResult::text(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_with_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "one\ntwo\nthree\nfour").unwrap();

        let tool = ReadFileTool::new();
        let result = tool
            .execute(
                "c1",
                json!({"path": path.display().to_string(), "offset": 2, "limit": 2}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error);
        let output = result.payload["output"].as_str().unwrap();
        assert!(output.starts_with("two\nthree"));
        assert!(output.contains("Use offset=4"));
    }

    #[tokio::test]
    async fn test_missing_file_is_structured_error() {
        let tool = ReadFileTool::new();
        let result = tool
            .execute("c1", json!({"path": "/definitely/not/here.txt"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
        assert_eq!(result.payload["error"], true);
        assert!(result.payload["suggestion"].is_string());
    }

    #[test]
    fn test_read_target_expands_home() {
        let tool = ReadFileTool::new();
        let target = tool.read_target(&json!({"path": "~/.ssh/id_rsa"})).unwrap();
        assert!(!target.starts_with('~'));
        assert!(target.ends_with("id_rsa"));
    }
}
