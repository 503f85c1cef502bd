//! Configuration: provider credentials, generation knobs, data paths.
//!
//! Loads from `$TANDEM_HOME/config.toml` with sensible defaults. Providers
//! are configured as `[providers.<id>]` tables and resolved by id at
//! generation time.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Optional system prompt prepended to every provider request.
    pub system_prompt: Option<String>,

    /// Hard cap on request → tool → request round-trips per generation.
    pub max_iterations: usize,

    /// Timeout for a single tool execution in seconds (0 disables).
    pub tool_timeout_secs: u64,

    /// Configured providers keyed by id.
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            tool_timeout_secs: Self::DEFAULT_TOOL_TIMEOUT_SECS,
            providers: HashMap::new(),
        }
    }
}

impl Config {
    pub const DEFAULT_MAX_ITERATIONS: usize = 24;
    /// Default is disabled
    const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 0;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        for (id, provider) in &config.providers {
            url::Url::parse(&provider.base_url)
                .with_context(|| format!("Invalid base URL for provider {id}"))?;
        }
        Ok(config)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        if self.tool_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.tool_timeout_secs))
        }
    }
}

/// Per-provider credentials and transport settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the provider's OpenAI-compatible endpoint.
    pub base_url: String,

    /// API key; takes precedence over `api_key_env`.
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: Option<String>,

    /// Known model ids; an empty list disables model validation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Additional headers sent with every request.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extra_headers: HashMap<String, String>,
}

impl ProviderConfig {
    /// Resolves the API key with precedence: config > environment.
    pub fn effective_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            let trimmed = key.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

pub mod paths {
    //! Path resolution for configuration and data directories.
    //!
    //! TANDEM_HOME resolution order:
    //! 1. TANDEM_HOME environment variable (if set)
    //! 2. ~/.config/tandem (default)

    use std::path::{Path, PathBuf};

    /// Returns the tandem home directory.
    pub fn home() -> PathBuf {
        if let Ok(home) = std::env::var("TANDEM_HOME") {
            return PathBuf::from(home);
        }
        std::env::var("HOME").map_or_else(
            |_| PathBuf::from(".tandem"),
            |home| Path::new(&home).join(".config").join("tandem"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        home().join("config.toml")
    }

    /// Returns the directory holding persisted session records.
    pub fn sessions_dir() -> PathBuf {
        home().join("sessions")
    }
}
