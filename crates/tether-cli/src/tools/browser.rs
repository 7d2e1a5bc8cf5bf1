//! Browser automation tools.
//!
//! The tools describe actions; a [`BrowserDriver`] carries them out. The
//! shipped driver pipes each action as JSON into an external automation
//! command and reads a JSON (or plain text) reply from its stdout.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::process::Stdio;
use std::sync::Arc;
use tether_agent::tool::{RiskTier, Tool, ToolResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// An action for the browser driver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrowserAction {
    Navigate { url: String },
    Type { selector: String, text: String, submit: bool },
    Click { selector: String },
    Press { key: String },
    Login { url: String, reason: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("browser command failed: {0}")]
    Command(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Something that can drive a browser
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn perform(
        &self,
        action: BrowserAction,
        cancel: CancellationToken,
    ) -> Result<Value, BrowserError>;
}

/// Driver that runs a shell command per action
pub struct CommandBrowserDriver {
    command: String,
}

impl CommandBrowserDriver {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl BrowserDriver for CommandBrowserDriver {
    async fn perform(
        &self,
        action: BrowserAction,
        cancel: CancellationToken,
    ) -> Result<Value, BrowserError> {
        let input = serde_json::to_vec(&action).map_err(|e| BrowserError::Command(e.to_string()))?;

        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };
        let mut child = Command::new(shell)
            .arg(shell_arg)
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // the exit status below reports a driver that quit early
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!("Browser command did not read its input: {}", e);
            }
            drop(stdin);
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BrowserError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(BrowserError::Command(if stderr.is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Ok(json!({ "ok": true }));
        }
        Ok(serde_json::from_str(&stdout).unwrap_or_else(|_| json!({ "output": stdout })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrowserToolKind {
    Navigate,
    Type,
    Click,
    Press,
    Login,
}

/// One browser tool; the kind decides name, schema and tier
pub struct BrowserTool {
    kind: BrowserToolKind,
    driver: Arc<dyn BrowserDriver>,
}

impl BrowserTool {
    /// Every browser tool sharing one driver
    pub fn all(driver: Arc<dyn BrowserDriver>) -> Vec<BrowserTool> {
        [
            BrowserToolKind::Navigate,
            BrowserToolKind::Type,
            BrowserToolKind::Click,
            BrowserToolKind::Press,
            BrowserToolKind::Login,
        ]
        .into_iter()
        .map(|kind| BrowserTool {
            kind,
            driver: Arc::clone(&driver),
        })
        .collect()
    }

    fn action(&self, arguments: &Value) -> Option<BrowserAction> {
        let str_arg = |key: &str| arguments.get(key).and_then(Value::as_str).map(String::from);
        Some(match self.kind {
            BrowserToolKind::Navigate => BrowserAction::Navigate { url: str_arg("url")? },
            BrowserToolKind::Type => BrowserAction::Type {
                selector: str_arg("selector")?,
                text: str_arg("text")?,
                submit: arguments.get("submit").and_then(Value::as_bool).unwrap_or(false),
            },
            BrowserToolKind::Click => BrowserAction::Click {
                selector: str_arg("selector")?,
            },
            BrowserToolKind::Press => BrowserAction::Press { key: str_arg("key")? },
            BrowserToolKind::Login => BrowserAction::Login {
                url: str_arg("url")?,
                reason: str_arg("reason"),
            },
        })
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        match self.kind {
            BrowserToolKind::Navigate => "browser_navigate",
            BrowserToolKind::Type => "browser_type",
            BrowserToolKind::Click => "browser_click",
            BrowserToolKind::Press => "browser_press",
            BrowserToolKind::Login => "request_login",
        }
    }

    fn description(&self) -> &str {
        match self.kind {
            BrowserToolKind::Navigate => "Open a URL in the browser.",
            BrowserToolKind::Type => {
                "Type text into the element matching a CSS selector. Set submit to press Enter afterwards."
            }
            BrowserToolKind::Click => "Click the element matching a CSS selector.",
            BrowserToolKind::Press => "Press a key, e.g. Enter, Tab, Escape or ArrowDown.",
            BrowserToolKind::Login => {
                "Open a login page and ask the user to sign in themselves. Never type credentials for the user. \
The turn ends so the user can tell you when they are done."
            }
        }
    }

    fn parameters_schema(&self) -> Value {
        match self.kind {
            BrowserToolKind::Navigate => json!({
                "type": "object",
                "properties": { "url": { "type": "string", "description": "Absolute URL to open" } },
                "required": ["url"]
            }),
            BrowserToolKind::Type => json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string" },
                    "text": { "type": "string" },
                    "submit": { "type": "boolean", "description": "Press Enter after typing" }
                },
                "required": ["selector", "text"],
                "additionalProperties": false
            }),
            BrowserToolKind::Click => json!({
                "type": "object",
                "properties": { "selector": { "type": "string" } },
                "required": ["selector"]
            }),
            BrowserToolKind::Press => json!({
                "type": "object",
                "properties": { "key": { "type": "string" } },
                "required": ["key"]
            }),
            BrowserToolKind::Login => json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Login page URL" },
                    "reason": { "type": "string", "description": "What the login is needed for" }
                },
                "required": ["url"]
            }),
        }
    }

    fn tier(&self) -> RiskTier {
        match self.kind {
            BrowserToolKind::Click | BrowserToolKind::Press => RiskTier::Moderate,
            _ => RiskTier::Dangerous,
        }
    }

    /// `browser_type` flag spellings: pressEnter, press_enter, enter
    fn repair(&self, arguments: &Value) -> Option<Value> {
        if self.kind != BrowserToolKind::Type {
            return None;
        }
        let object = arguments.as_object()?;
        let mut repaired = Map::new();
        let mut submit = None;
        for (key, value) in object {
            match key.as_str() {
                "pressEnter" | "press_enter" | "enter" | "submit" => {
                    submit = match value {
                        Value::Bool(b) => Some(*b),
                        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
                        _ => submit,
                    };
                }
                "value" | "input" if !object.contains_key("text") => {
                    repaired.insert("text".into(), value.clone());
                }
                "element" | "target" if !object.contains_key("selector") => {
                    repaired.insert("selector".into(), value.clone());
                }
                "selector" | "text" => {
                    repaired.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
        if let Some(submit) = submit {
            repaired.insert("submit".into(), json!(submit));
        }
        Some(Value::Object(repaired))
    }

    fn ends_turn(&self) -> bool {
        self.kind == BrowserToolKind::Login
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let Some(action) = self.action(&arguments) else {
            return ToolResult::error(
                format!("Missing arguments for {}", self.name()),
                "Check the tool's parameter schema.",
            );
        };
        let is_login = matches!(action, BrowserAction::Login { .. });

        match self.driver.perform(action, cancel).await {
            Ok(reply) if is_login => ToolResult::success(json!({
                "status": "awaiting_user",
                "message": "The login page is open. Wait for the user to confirm they have signed in.",
                "browser": reply,
            })),
            Ok(reply) => ToolResult::success(reply),
            Err(BrowserError::Cancelled) => ToolResult::cancelled(),
            Err(e) => ToolResult::error(
                e.to_string(),
                "The page may have changed. Navigate again or try a different selector.",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingDriver {
        actions: Mutex<Vec<BrowserAction>>,
    }

    #[async_trait]
    impl BrowserDriver for RecordingDriver {
        async fn perform(
            &self,
            action: BrowserAction,
            _cancel: CancellationToken,
        ) -> Result<Value, BrowserError> {
            self.actions.lock().push(action);
            Ok(json!({"ok": true}))
        }
    }

    fn tool(kind: BrowserToolKind, driver: Arc<RecordingDriver>) -> BrowserTool {
        BrowserTool { kind, driver }
    }

    #[test]
    fn test_tiers() {
        let driver = Arc::new(RecordingDriver::default());
        let tiers: Vec<_> = BrowserTool::all(driver)
            .iter()
            .map(|t| (t.name().to_string(), t.tier()))
            .collect();
        assert!(tiers.contains(&("browser_navigate".into(), RiskTier::Dangerous)));
        assert!(tiers.contains(&("browser_type".into(), RiskTier::Dangerous)));
        assert!(tiers.contains(&("browser_click".into(), RiskTier::Moderate)));
        assert!(tiers.contains(&("browser_press".into(), RiskTier::Moderate)));
        assert!(tiers.contains(&("request_login".into(), RiskTier::Dangerous)));
    }

    #[tokio::test]
    async fn test_type_repairs_press_enter_flag() {
        let driver = Arc::new(RecordingDriver::default());
        let registry = tether_agent::ToolRegistry::new()
            .with_tool(Arc::new(tool(BrowserToolKind::Type, driver.clone())));

        let prepared = registry
            .prepare(
                "browser_type",
                json!({"selector": "#q", "text": "rust", "pressEnter": true}),
            )
            .unwrap();
        assert_eq!(
            prepared.arguments,
            json!({"selector": "#q", "text": "rust", "submit": true})
        );

        let result = registry
            .execute(&prepared, "c1", CancellationToken::new())
            .await;
        assert!(!result.is_error);
        assert_eq!(
            driver.actions.lock()[0],
            BrowserAction::Type {
                selector: "#q".into(),
                text: "rust".into(),
                submit: true
            }
        );
    }

    #[tokio::test]
    async fn test_login_ends_turn() {
        let driver = Arc::new(RecordingDriver::default());
        let login = tool(BrowserToolKind::Login, driver);
        assert!(login.ends_turn());
        let result = login
            .execute("c1", json!({"url": "https://example.com/login"}), CancellationToken::new())
            .await;
        assert_eq!(result.payload["status"], "awaiting_user");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_driver_pipes_json() {
        let driver = CommandBrowserDriver::new("cat");
        let reply = driver
            .perform(
                BrowserAction::Press { key: "Enter".into() },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"action": "press", "key": "Enter"}));

        let failing = CommandBrowserDriver::new("echo broken >&2; exit 1");
        let err = failing
            .perform(BrowserAction::Click { selector: "a".into() }, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
