//! Built-in tools

mod ask_question;
mod bash;
mod browser;
mod list_directory;
mod read_file;

pub use ask_question::AskQuestionTool;
pub use bash::BashTool;
pub use browser::{BrowserAction, BrowserDriver, BrowserError, BrowserTool, CommandBrowserDriver};
pub use list_directory::ListDirectoryTool;
pub use read_file::ReadFileTool;

use std::path::Path;
use std::sync::Arc;
use tether_agent::{SafetyFilter, ToolRegistry};

/// Registry holding every built-in tool. Browser tools are only added when
/// a driver is available. Everything under `data_dir` is off limits to the
/// read tools.
pub fn builtin_registry(browser: Option<Arc<dyn BrowserDriver>>, data_dir: &Path) -> ToolRegistry {
    let safety = SafetyFilter::new().with_protected_path(data_dir.display().to_string());
    let mut registry = ToolRegistry::new()
        .with_safety_filter(safety)
        .with_tool(Arc::new(ReadFileTool::new()))
        .with_tool(Arc::new(ListDirectoryTool::new()))
        .with_tool(Arc::new(BashTool::new()))
        .with_tool(Arc::new(AskQuestionTool::new()));

    if let Some(driver) = browser {
        for tool in BrowserTool::all(driver) {
            registry.register(Arc::new(tool));
        }
    }
    registry
}
