//! Configuration file support

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_agent::approval::DEFAULT_APPROVAL_TIMEOUT;
use tether_agent::{AgentConfig, CompactionConfig, Skill, SystemPrompt};

/// Model used when neither the flag nor the config file names one
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Configuration for tether
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model to use
    pub model: Option<String>,
    /// OpenAI-compatible endpoint, e.g. https://openrouter.ai/api/v1
    pub base_url: Option<String>,
    /// API key (alternative to environment variables)
    pub api_key: Option<String>,
    /// Maximum model/tool round trips per turn
    pub max_steps: Option<u32>,
    /// Seconds before an unanswered approval counts as denied
    pub approval_timeout_secs: Option<u64>,
    /// Custom core system prompt file path
    pub system_prompt_file: Option<String>,
    /// Markdown files appended to the system prompt as skills
    pub skill_files: Vec<String>,
    /// Browser automation command used by the browser tools
    pub browser_command: Option<String>,
    /// Where conversations are stored
    pub data_dir: Option<String>,
    #[serde(default)]
    pub compaction: CompactionSettings,
}

/// Overrides for context compaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
    pub keep_last: Option<usize>,
    pub emergency_keep_last: Option<usize>,
}

impl CompactionSettings {
    pub fn to_config(&self) -> CompactionConfig {
        let defaults = CompactionConfig::default();
        CompactionConfig {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            threshold: self.threshold.unwrap_or(defaults.threshold).clamp(0.1, 1.0),
            keep_last: self.keep_last.unwrap_or(defaults.keep_last).max(1),
            emergency_keep_last: self
                .emergency_keep_last
                .unwrap_or(defaults.emergency_keep_last)
                .max(1),
            ..defaults
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TETHER_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// API key from the config, then the environment
    pub fn api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            ["OPENAI_API_KEY", "OPENROUTER_API_KEY"]
                .iter()
                .find_map(|var| std::env::var(var).ok())
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => expand_home(dir),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tether"),
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        self.approval_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT)
    }

    /// Build the agent configuration, reading prompt and skill files
    pub fn agent_config(&self) -> anyhow::Result<AgentConfig> {
        let mut system_prompt = match &self.system_prompt_file {
            Some(file) => {
                let path = expand_home(file);
                let core = fs::read_to_string(&path)
                    .with_context(|| format!("reading system prompt {}", path.display()))?;
                SystemPrompt::new(core)
            }
            None => SystemPrompt::default(),
        };

        let mut skills = Vec::new();
        for file in &self.skill_files {
            let path = expand_home(file);
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading skill {}", path.display()))?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.clone());
            skills.push(Skill::new(name, content));
        }
        system_prompt = system_prompt.with_skills(skills);

        let defaults = AgentConfig::default();
        Ok(AgentConfig {
            system_prompt,
            max_steps: self.max_steps.unwrap_or(defaults.max_steps).max(1),
            compaction: self.compaction.to_config(),
            ..defaults
        })
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') || rest.starts_with('\\') => {
            home.join(&rest[1..])
        }
        _ => PathBuf::from(path),
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# tether configuration file
# Place at ~/.config/tether/config.toml (Linux), ~/Library/Application Support/tether/config.toml
# (macOS) or %APPDATA%\tether\config.toml (Windows), or point TETHER_CONFIG_PATH at it.

# Default model to use
model = "gpt-4o"

# Any OpenAI-compatible endpoint
# base_url = "https://openrouter.ai/api/v1"

# API key (optional - OPENAI_API_KEY or OPENROUTER_API_KEY also work)
# api_key = "sk-..."

# Maximum model/tool round trips per turn
max_steps = 15

# Seconds before an unanswered approval prompt counts as a denial
approval_timeout_secs = 60

# Custom core system prompt file (optional)
# system_prompt_file = "~/.config/tether/system_prompt.md"

# Skill documents appended to the system prompt
skill_files = []

# Command driving the browser tools; receives the action as JSON on stdin
# browser_command = "tether-browser"

# Where conversations are stored (defaults to the platform data directory)
# data_dir = "~/.local/share/tether"

[compaction]
enabled = true
threshold = 0.8
keep_last = 10
emergency_keep_last = 4
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.max_steps, Some(15));
        assert_eq!(config.approval_timeout(), Duration::from_secs(60));

        let compaction = config.compaction.to_config();
        assert_eq!(compaction.keep_last, 10);
        assert_eq!(compaction.emergency_keep_last, 4);
        assert!((compaction.threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = toml::from_str("model = \"qwen-2.5\"").unwrap();
        assert_eq!(config.approval_timeout(), DEFAULT_APPROVAL_TIMEOUT);
        let agent = config.agent_config().unwrap();
        assert_eq!(agent.max_steps, 15);
        assert!(agent.system_prompt.skills.is_empty());
    }

    #[test]
    fn test_skill_files_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let skill = dir.path().join("spreadsheets.md");
        fs::write(&skill, "Use csv tools.").unwrap();

        let config = Config {
            skill_files: vec![skill.display().to_string()],
            ..Config::default()
        };
        let agent = config.agent_config().unwrap();
        assert_eq!(agent.system_prompt.skills[0].name, "spreadsheets");
        assert!(agent.system_prompt.render().contains("Use csv tools."));
    }

    #[test]
    fn test_load_from_bad_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "model = [").unwrap();
        assert!(Config::load_from(&path).model.is_none());
    }
}
