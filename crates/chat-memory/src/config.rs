use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MemoryError, Result};

const DEFAULT_CONFIG_FILE: &str = "config/memory";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub memory: MemoryConfig,
    pub summarizer: SummarizerConfig,
}

/// Memory cache and persistence policy.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding one `user_<id>.json` snapshot per user
    pub snapshot_dir: PathBuf,

    /// Estimated tokens (summary + turns) before summarization kicks in
    pub token_limit: usize,

    /// Persist a user every N recorded interactions
    pub save_interval: u64,

    /// Max users kept in RAM
    pub max_cached_users: usize,

    /// Most recent turns kept verbatim when summarizing
    pub recent_window: usize,

    pub summarize_timeout_ms: u64,

    /// Snapshots untouched for longer than this are reaped
    pub retention_days: u64,

    pub tokens_per_word: f64,

    pub cleanup_interval_secs: u64,
    pub flush_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("./data/conversations"),
            token_limit: 1500,
            save_interval: 5,
            max_cached_users: 100,
            recent_window: 4,
            summarize_timeout_ms: 30_000,
            retention_days: 30,
            tokens_per_word: 1.3,
            cleanup_interval_secs: 24 * 60 * 60,
            flush_interval_secs: 5 * 60,
        }
    }
}

impl MemoryConfig {
    /// Reject configurations the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_cached_users == 0 {
            return Err(MemoryError::Config(
                "max_cached_users must be greater than zero".to_string(),
            ));
        }
        if self.save_interval == 0 {
            return Err(MemoryError::Config(
                "save_interval must be greater than zero".to_string(),
            ));
        }
        if self.token_limit == 0 {
            return Err(MemoryError::Config(
                "token_limit must be greater than zero".to_string(),
            ));
        }
        if self.recent_window == 0 {
            return Err(MemoryError::Config(
                "recent_window must keep at least one turn".to_string(),
            ));
        }
        if self.summarize_timeout_ms == 0 {
            return Err(MemoryError::Config(
                "summarize_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !self.tokens_per_word.is_finite() || self.tokens_per_word <= 0.0 {
            return Err(MemoryError::Config(format!(
                "tokens_per_word must be a positive number, got {}",
                self.tokens_per_word
            )));
        }
        Ok(())
    }

    pub fn summarize_timeout(&self) -> Duration {
        Duration::from_millis(self.summarize_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        days(self.retention_days)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

/// Whole days as a `Duration`, saturating on overflow.
pub fn days(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(24 * 60 * 60))
}

/// OpenAI-compatible chat completion endpoint used for summaries.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SummarizerConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_seconds: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            // cheap and deterministic enough for summaries
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 300,
            timeout_seconds: 30,
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and `APP__*` env vars.
    ///
    /// Example: `APP__MEMORY__TOKEN_LIMIT=2000`, `APP__SUMMARIZER__MODEL=gpt-4o`.
    /// `OPENAI_API_KEY` is used when no summarizer key is configured.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match config_file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        if settings.summarizer.api_key.is_none() {
            settings.summarizer.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty());
        }

        settings.memory.validate()?;
        Ok(settings)
    }
}
