use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{DEFAULT_HISTORY_CAP, DEFAULT_MEMORY_MAX_CHARS, DEFAULT_PROMPT_WINDOW};
use crate::tools::web_search::DEFAULT_SEARCH_API_URL;
use crate::tools::DEFAULT_SNIPPET_CHARS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub api_url: String,
    /// Search is disabled while this is unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    /// Extra trigger phrases on top of the built-in English/Thai list.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl SearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_url: default_search_url(),
            api_key: None,
            max_results: default_search_max_results(),
            snippet_chars: default_snippet_chars(),
            keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Telegram user ids treated as administrators.
    #[serde(default)]
    pub admin_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Discord user snowflakes treated as administrators.
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // LLM configuration (OpenAI-compatible: Groq, OpenAI, Ollama, vLLM, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    // Agent Identity
    #[serde(default = "default_agent_name", alias = "username")]
    pub agent_name: String,

    /// Platform-scoped user keys (e.g. "telegram:123") with elevated authority.
    #[serde(default)]
    pub admin_ids: Vec<String>,

    // Session limits
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default = "default_prompt_window")]
    pub prompt_window: usize,
    #[serde(default = "default_memory_max_chars")]
    pub memory_max_chars: usize,

    // Timeouts for external calls
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
}

fn default_llm_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_agent_name() -> String {
    "Rapport".to_string()
}

fn default_history_cap() -> usize {
    DEFAULT_HISTORY_CAP
}

fn default_prompt_window() -> usize {
    DEFAULT_PROMPT_WINDOW
}

fn default_memory_max_chars() -> usize {
    DEFAULT_MEMORY_MAX_CHARS
}

fn default_completion_timeout_secs() -> u64 {
    60
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_store_timeout_secs() -> u64 {
    10
}

fn default_database_path() -> String {
    "rapport_sessions.db".to_string()
}

fn default_search_url() -> String {
    DEFAULT_SEARCH_API_URL.to_string()
}

fn default_search_max_results() -> usize {
    5
}

fn default_snippet_chars() -> usize {
    DEFAULT_SNIPPET_CHARS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            agent_name: default_agent_name(),
            admin_ids: Vec::new(),
            history_cap: default_history_cap(),
            prompt_window: default_prompt_window(),
            memory_max_chars: default_memory_max_chars(),
            completion_timeout_secs: default_completion_timeout_secs(),
            search_timeout_secs: default_search_timeout_secs(),
            store_timeout_secs: default_store_timeout_secs(),
            database_path: default_database_path(),
            search: SearchConfig::default(),
            telegram: TelegramConfig::default(),
            discord: DiscordConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("rapport_config.toml")
    }

    /// Load config from rapport_config.toml next to the executable, falling
    /// back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                return config;
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to parse {:?}: {:#}", path, e),
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        let config = toml::from_str::<AgentConfig>(&contents)
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(Some(config))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok());
        config
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(model) = non_empty("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = non_empty("LLM_API_KEY").or_else(|| non_empty("GROQ_API_KEY")) {
            self.llm_api_key = Some(key);
        }

        if let Some(name) = non_empty("AGENT_NAME") {
            self.agent_name = name;
        }

        if let Some(ids) = non_empty("RAPPORT_ADMIN_IDS") {
            self.admin_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(path) = non_empty("RAPPORT_DATABASE_PATH") {
            self.database_path = path;
        }

        if let Some(url) = non_empty("SEARCH_API_URL") {
            self.search.api_url = url;
        }

        if let Some(key) = non_empty("SEARCH_API_KEY").or_else(|| non_empty("TAVILY_API_KEY")) {
            self.search.api_key = Some(key);
        }

        if let Some(token) =
            non_empty("TELEGRAM_BOT_TOKEN").or_else(|| non_empty("TELEGRAM_TOKEN"))
        {
            self.telegram.bot_token = Some(token.trim().to_string());
        }

        if let Some(token) = non_empty("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = Some(token.trim().to_string());
        }
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs.max(1))
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.max(1))
    }
}
