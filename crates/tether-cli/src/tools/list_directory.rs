//! List directory tool

use async_trait::async_trait;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tether_agent::tool::{Tool, ToolResult};
use tokio_util::sync::CancellationToken;

use crate::config::expand_home;

const DEFAULT_LIMIT: usize = 200;

/// Tool for listing directory contents
pub struct ListDirectoryTool;

impl ListDirectoryTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ListDirectoryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the contents of a directory with file sizes. Use ~ for the home directory, e.g. ~/Desktop."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path to list"
                },
                "show_hidden": {
                    "type": "boolean",
                    "description": "Whether to show hidden files (default: false)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum number of entries to return (default: 200)"
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
        let path = expand_home(arguments.get("path").and_then(Value::as_str).unwrap_or("."));
        let show_hidden = arguments
            .get("show_hidden")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT);

        if !path.is_dir() {
            return ToolResult::error(
                format!("Not a directory: {}", path.display()),
                "Check the path, or list the parent directory first.",
            );
        }

        let read_dir = match fs::read_dir(&path) {
            Ok(d) => d,
            Err(e) => {
                return ToolResult::error(
                    format!("Error reading directory {}: {}", path.display(), e),
                    "The directory may not be readable; ask the user about permissions.",
                );
            }
        };

        let mut items: Vec<_> = read_dir.flatten().collect();
        items.sort_by_key(|e| e.file_name());

        let mut entries = Vec::new();
        let mut total = 0usize;
        for entry in items {
            if cancel.is_cancelled() {
                return ToolResult::cancelled();
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            total += 1;
            if entries.len() < limit {
                entries.push(format_entry(&name, &entry.path(), entry.metadata().ok().as_ref()));
            }
        }

        if entries.is_empty() {
            return ToolResult::text("(empty directory)");
        }

        let mut output = entries.join("\n");
        if total > entries.len() {
            output.push_str(&format!(
                "\n\n(showing first {} of {} entries)",
                entries.len(),
                total
            ));
        }
        ToolResult::text(output)
    }
}

fn format_entry(name: &str, path: &Path, metadata: Option<&fs::Metadata>) -> String {
    let type_indicator = if path.is_dir() { "/" } else { "" };

    match metadata {
        Some(m) if m.is_file() => format!("{}\t{}", name, format_size(m.len())),
        _ => format!("{}{}", name, type_indicator),
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.path().join("a_dir")).unwrap();

        let result = ListDirectoryTool::new()
            .execute(
                "c1",
                json!({"path": dir.path().display().to_string()}),
                CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error);
        assert_eq!(result.payload["output"], "a_dir/\nb.txt\t5B");
    }

    #[tokio::test]
    async fn test_limit_reports_total() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}")), "").unwrap();
        }
        let result = ListDirectoryTool::new()
            .execute(
                "c1",
                json!({"path": dir.path().display().to_string(), "limit": 2}),
                CancellationToken::new(),
            )
            .await;
        assert!(result.payload["output"]
            .as_str()
            .unwrap()
            .contains("showing first 2 of 5"));
    }

    #[tokio::test]
    async fn test_not_a_directory() {
        let result = ListDirectoryTool::new()
            .execute("c1", json!({"path": "/no/such/dir"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0K");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0M");
    }
}
