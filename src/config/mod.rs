use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub shortcuts: ShortcutsConfig,

    #[serde(default)]
    pub vision: VisionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API key, or "${SOME_ENV_VAR}" to read it from the environment.
    #[serde(default)]
    pub key: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum tokens for a model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Whole-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Tool rounds per user turn before the loop is cut off
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// User rounds kept in the prompt window (0 = unlimited)
    #[serde(default = "default_window_rounds")]
    pub window_rounds: usize,

    /// Hard cap on prompt messages after the round window (0 = unlimited)
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Stream responses token by token
    #[serde(default = "default_true")]
    pub stream: bool,
}

/// Local Q&A response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry lifetime in seconds (default: one week)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    /// Replies shorter than this are not worth caching
    #[serde(default = "default_min_response_chars")]
    pub min_response_chars: usize,

    /// Similarity threshold for the fuzzy tier (0.0 - 1.0)
    #[serde(default = "default_similarity")]
    pub similarity: f64,

    /// Length-ratio bounds that gate fuzzy comparison
    #[serde(default = "default_min_length_ratio")]
    pub min_length_ratio: f64,

    #[serde(default = "default_max_length_ratio")]
    pub max_length_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Rotate the log once it grows past this many bytes
    #[serde(default = "default_history_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Records kept in memory for search (0 = unlimited)
    #[serde(default = "default_history_max_records")]
    pub max_memory_records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortcutsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Inputs longer than this never match a shortcut phrase
    #[serde(default = "default_shortcut_max_chars")]
    pub max_chars: usize,
}

/// Viewport capture defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_capture_width")]
    pub width: u32,

    #[serde(default = "default_capture_height")]
    pub height: u32,

    /// Image detail hint passed to the provider: "low" | "high" | "auto"
    #[serde(default = "default_capture_detail")]
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_max_tokens() -> usize {
    4096
}
fn default_timeout_secs() -> u64 {
    180
}
fn default_max_tool_rounds() -> usize {
    10
}
fn default_window_rounds() -> usize {
    10
}
fn default_max_history() -> usize {
    20
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    604_800 // one week
}
fn default_cache_max_entries() -> usize {
    200
}
fn default_min_response_chars() -> usize {
    10
}
fn default_similarity() -> f64 {
    0.75
}
fn default_min_length_ratio() -> f64 {
    0.3
}
fn default_max_length_ratio() -> f64 {
    3.0
}
fn default_history_max_file_bytes() -> u64 {
    5_242_880 // 5MB
}
fn default_history_max_records() -> usize {
    2000
}
fn default_shortcut_max_chars() -> usize {
    30
}
fn default_capture_width() -> u32 {
    1280
}
fn default_capture_height() -> u32 {
    720
}
fn default_capture_detail() -> String {
    "high".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            window_rounds: default_window_rounds(),
            max_history: default_max_history(),
            stream: default_true(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
            min_response_chars: default_min_response_chars(),
            similarity: default_similarity(),
            min_length_ratio: default_min_length_ratio(),
            max_length_ratio: default_max_length_ratio(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_history_max_file_bytes(),
            max_memory_records: default_history_max_records(),
        }
    }
}

impl Default for ShortcutsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_chars: default_shortcut_max_chars(),
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            width: default_capture_width(),
            height: default_capture_height(),
            detail: default_capture_detail(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;

        // Expand environment variables in the API key
        config.api.key = expand_env(&config.api.key);

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["api", "key"] => Ok(mask_key(&self.api.key)),
            ["api", "base_url"] => Ok(self.api.base_url.clone()),
            ["api", "model"] => Ok(self.api.model.clone()),
            ["api", "max_tokens"] => Ok(self.api.max_tokens.to_string()),
            ["api", "timeout_secs"] => Ok(self.api.timeout_secs.to_string()),
            ["chat", "max_tool_rounds"] => Ok(self.chat.max_tool_rounds.to_string()),
            ["chat", "window_rounds"] => Ok(self.chat.window_rounds.to_string()),
            ["chat", "max_history"] => Ok(self.chat.max_history.to_string()),
            ["chat", "stream"] => Ok(self.chat.stream.to_string()),
            ["cache", "enabled"] => Ok(self.cache.enabled.to_string()),
            ["cache", "ttl_secs"] => Ok(self.cache.ttl_secs.to_string()),
            ["cache", "similarity"] => Ok(self.cache.similarity.to_string()),
            ["shortcuts", "enabled"] => Ok(self.shortcuts.enabled.to_string()),
            ["vision", "detail"] => Ok(self.vision.detail.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["api", "key"] => self.api.key = value.to_string(),
            ["api", "base_url"] => self.api.base_url = value.to_string(),
            ["api", "model"] => self.api.model = value.to_string(),
            ["api", "max_tokens"] => self.api.max_tokens = value.parse()?,
            ["api", "timeout_secs"] => self.api.timeout_secs = value.parse()?,
            ["chat", "max_tool_rounds"] => self.chat.max_tool_rounds = value.parse()?,
            ["chat", "window_rounds"] => self.chat.window_rounds = value.parse()?,
            ["chat", "max_history"] => self.chat.max_history = value.parse()?,
            ["chat", "stream"] => self.chat.stream = value.parse()?,
            ["cache", "enabled"] => self.cache.enabled = value.parse()?,
            ["cache", "ttl_secs"] => self.cache.ttl_secs = value.parse()?,
            ["cache", "similarity"] => self.cache.similarity = value.parse()?,
            ["shortcuts", "enabled"] => self.shortcuts.enabled = value.parse()?,
            ["vision", "detail"] => self.vision.detail = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Keys are never echoed back in full.
fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return "(not set)".to_string();
    }
    let visible: String = key.chars().take(4).collect();
    format!("{visible}***")
}

/// Default config template with helpful comments (used for first-time setup)
pub(crate) const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Scenepilot Configuration
# Auto-created on first run. Edit as needed.

[api]
# Any OpenAI-compatible chat completions endpoint works.
# key = "${OPENAI_API_KEY}"
key = ""
base_url = "https://api.openai.com/v1"
model = "gpt-4o"
max_tokens = 4096
timeout_secs = 180

[chat]
# Tool rounds per user turn before the loop is cut off
max_tool_rounds = 10
# User rounds kept in the prompt window
window_rounds = 10
# Hard cap on prompt messages after the round window
max_history = 20
stream = true

[cache]
# Local Q&A cache: identical (and near-identical) questions are answered
# without a model request.
enabled = true
ttl_secs = 604800
max_entries = 200
# similarity = 0.75

[history]
# Conversation log rotation threshold in bytes
max_file_bytes = 5242880

[shortcuts]
# Terse commands ("清零", "freeze", ...) run their tool directly.
enabled = true
max_chars = 30

[vision]
# Viewport capture defaults
width = 1280
height = 720
detail = "high"

[logging]
level = "info"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.api.base_url, "https://api.openai.com/v1");
        assert_eq!(config.api.model, "gpt-4o");
        assert_eq!(config.chat.max_tool_rounds, 10);
        assert_eq!(config.cache.ttl_secs, 604_800);
        assert_eq!(config.shortcuts.max_chars, 30);
        assert!(config.chat.stream);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            model = "qwen-max"

            [chat]
            max_tool_rounds = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.api.model, "qwen-max");
        assert_eq!(config.api.max_tokens, 4096);
        assert_eq!(config.chat.max_tool_rounds, 3);
        assert_eq!(config.chat.window_rounds, 10);
    }

    #[test]
    fn template_parses_back_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.api.model, "gpt-4o");
        assert_eq!(config.chat.max_tool_rounds, 10);
        assert_eq!(config.vision.width, 1280);
    }

    #[test]
    fn get_and_set_roundtrip() {
        let mut config = Config::default();
        config.set_value("api.model", "gpt-4o-mini").unwrap();
        assert_eq!(config.get_value("api.model").unwrap(), "gpt-4o-mini");

        config.set_value("chat.max_tool_rounds", "5").unwrap();
        assert_eq!(config.chat.max_tool_rounds, 5);

        assert!(config.set_value("chat.max_tool_rounds", "lots").is_err());
        assert!(config.set_value("nope.nope", "x").is_err());
        assert!(config.get_value("nope.nope").is_err());
    }

    #[test]
    fn api_key_is_masked_when_read() {
        let mut config = Config::default();
        assert_eq!(config.get_value("api.key").unwrap(), "(not set)");
        config.set_value("api.key", "sk-abcdef123456").unwrap();
        assert_eq!(config.get_value("api.key").unwrap(), "sk-a***");
    }

    #[test]
    fn env_expansion_forms() {
        // SAFETY: test-local env var, name unique to this test.
        unsafe { std::env::set_var("SCENEPILOT_TEST_KEY_VAR", "sk-expanded") };
        assert_eq!(expand_env("${SCENEPILOT_TEST_KEY_VAR}"), "sk-expanded");
        assert_eq!(expand_env("$SCENEPILOT_TEST_KEY_VAR"), "sk-expanded");
        assert_eq!(expand_env("literal-key"), "literal-key");
        assert_eq!(expand_env("${MISSING_VAR_XYZ}"), "${MISSING_VAR_XYZ}");
    }
}
