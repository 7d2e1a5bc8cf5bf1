//! Shell command execution tool

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::process::Stdio;
use tether_agent::tool::{RiskTier, Tool, ToolResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Maximum output size in bytes before truncation
const MAX_OUTPUT_SIZE: usize = 100_000;
/// Maximum number of lines before truncation
const MAX_OUTPUT_LINES: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Tool for executing shell commands
pub struct BashTool;

impl BashTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded collector for one output stream
#[derive(Default)]
struct Captured {
    text: String,
    lines: usize,
    truncated: bool,
    done: bool,
}

impl Captured {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.lines >= MAX_OUTPUT_LINES || self.text.len() + line.len() > MAX_OUTPUT_SIZE {
            self.truncated = true;
            return;
        }
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.lines += 1;
    }

    fn render(&self, label: &str) -> String {
        let mut out = self.text.clone();
        if self.truncated {
            out.push_str(&format!(
                "\n\n... ({} truncated at {} lines / {}KB)",
                label,
                self.lines,
                MAX_OUTPUT_SIZE / 1024
            ));
        }
        out
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command on the user's machine. Returns stdout and stderr. Requires the user's approval."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Timeout in seconds (default: 120)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn tier(&self) -> RiskTier {
        RiskTier::Dangerous
    }

    /// Models sometimes send `cmd`/`script` and a string timeout
    fn repair(&self, arguments: &Value) -> Option<Value> {
        let object = arguments.as_object()?;
        let command = ["command", "cmd", "script", "shell"]
            .iter()
            .find_map(|key| object.get(*key)?.as_str())?;

        let mut repaired = Map::new();
        repaired.insert("command".into(), json!(command));
        match object.get("timeout") {
            Some(Value::Number(n)) => {
                repaired.insert("timeout".into(), Value::Number(n.clone()));
            }
            Some(Value::String(s)) => {
                if let Ok(secs) = s.trim().parse::<u64>() {
                    repaired.insert("timeout".into(), json!(secs));
                }
            }
            _ => {}
        }
        Some(Value::Object(repaired))
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let Some(command) = arguments.get("command").and_then(Value::as_str) else {
            return ToolResult::error("Missing 'command' argument", "Pass the command as 'command'.");
        };
        let timeout_secs = arguments
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut child = match Command::new(shell)
            .arg(shell_arg)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::error(
                    format!("Failed to spawn command: {}", e),
                    "Check that a shell is available.",
                );
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ToolResult::error("Failed to capture command output", "Try again.");
        };
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut out = Captured::default();
        let mut err = Captured::default();
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(timeout_secs);

        // Drain both pipes before collecting the exit status
        while !(out.done && err.done) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    tracing::debug!(command, "Command killed on cancellation");
                    return ToolResult::cancelled();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    return ToolResult::error(
                        format!(
                            "Command timed out after {} seconds\n{}\n{}",
                            timeout_secs,
                            out.render("stdout"),
                            err.render("stderr")
                        ),
                        "Use a longer timeout or a command that finishes sooner.",
                    );
                }
                line = stdout_reader.next_line(), if !out.done => match line {
                    Ok(Some(l)) => out.push(&l),
                    Ok(None) => out.done = true,
                    Err(e) => {
                        err.push(&format!("stdout read error: {}", e));
                        out.done = true;
                    }
                },
                line = stderr_reader.next_line(), if !err.done => match line {
                    Ok(Some(l)) => err.push(&l),
                    Ok(None) => err.done = true,
                    Err(e) => {
                        err.push(&format!("stderr read error: {}", e));
                        err.done = true;
                    }
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ToolResult::cancelled();
            }
            status = child.wait() => status,
        };

        let mut result = out.render("stdout");
        let stderr_text = err.render("stderr");
        if !stderr_text.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&stderr_text);
        }
        if result.is_empty() {
            result = "(no output)".to_string();
        }

        match status {
            Ok(exit_status) if exit_status.success() => ToolResult::text(result),
            Ok(exit_status) => ToolResult::error(
                format!(
                    "{}\n\nCommand exited with code {}",
                    result,
                    exit_status.code().unwrap_or(-1)
                ),
                "Read the error output and fix the command before retrying.",
            ),
            Err(e) => ToolResult::error(format!("Failed to wait for command: {}", e), "Try again."),
        }
    }
}
