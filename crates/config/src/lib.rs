//! Configuration loading, validation, and management for Waypoint.
//!
//! Loads run settings from `~/.waypoint/config.toml` with environment
//! variable overrides. Settings are validated before a run config is built
//! from them, so a bad file fails at startup rather than mid-run.

pub mod options;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use options::{ProviderCallOptions, ReasoningEffort, ThinkingHint};

/// Serializable run settings.
///
/// Maps directly to `~/.waypoint/config.toml`. Everything a run needs except
/// the tool handlers themselves, which are code and are supplied separately.
#[derive(Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Resolved model identifier
    #[serde(default = "default_model")]
    pub model: String,

    /// Maximum model/tool round trips per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Consume model responses as a stream of deltas
    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Pass-through model call options (allow-listed)
    #[serde(default)]
    pub provider_options: ProviderCallOptions,

    /// Additional attempts after a failed tool invocation
    #[serde(default = "default_tool_max_retries")]
    pub tool_max_retries: u32,

    /// Delay between tool attempts
    #[serde(default = "default_tool_retry_backoff_ms")]
    pub tool_retry_backoff_ms: u64,

    /// Secret used to sign checkpoint tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,

    /// Checkpoint token lifetime; absent means tokens never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_ttl_ms: Option<u64>,

    /// Default system prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Bounded wait for a single model call
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Bounded wait for a tool invocation when the tool declares none
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_max_iterations() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_tool_max_retries() -> u32 {
    2
}
fn default_tool_retry_backoff_ms() -> u64 {
    250
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the question."
        .into()
}
fn default_model_timeout_secs() -> u64 {
    120
}
fn default_tool_timeout_secs() -> u64 {
    30
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for RunSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSettings")
            .field("model", &self.model)
            .field("max_iterations", &self.max_iterations)
            .field("streaming", &self.streaming)
            .field("provider_options", &self.provider_options)
            .field("tool_max_retries", &self.tool_max_retries)
            .field("tool_retry_backoff_ms", &self.tool_retry_backoff_ms)
            .field("token_secret", &redact(&self.token_secret))
            .field("token_ttl_ms", &self.token_ttl_ms)
            .field("system_prompt", &self.system_prompt)
            .field("model_timeout_secs", &self.model_timeout_secs)
            .field("tool_timeout_secs", &self.tool_timeout_secs)
            .finish()
    }
}

impl RunSettings {
    /// Load settings from the default path (~/.waypoint/config.toml).
    ///
    /// Environment variables take precedence over the file:
    /// - `WAYPOINT_MODEL`
    /// - `WAYPOINT_TOKEN_SECRET`
    /// - `WAYPOINT_SYSTEM_PROMPT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut settings = Self::load_from(&config_path)?;

        if let Ok(model) = std::env::var("WAYPOINT_MODEL") {
            settings.model = model;
        }
        if let Ok(secret) = std::env::var("WAYPOINT_TOKEN_SECRET") {
            settings.token_secret = Some(secret);
        }
        if let Ok(prompt) = std::env::var("WAYPOINT_SYSTEM_PROMPT") {
            settings.system_prompt = prompt;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".waypoint")
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }

        if self.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations must be greater than 0".into(),
            ));
        }

        if self.token_ttl_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "token_ttl_ms must be greater than 0 (omit it for no expiry)".into(),
            ));
        }

        if matches!(&self.token_secret, Some(secret) if secret.is_empty()) {
            return Err(ConfigError::ValidationError(
                "token_secret must not be empty".into(),
            ));
        }

        if self.model_timeout_secs == 0 || self.tool_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "model_timeout_secs and tool_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let settings = Self::default();
        toml::to_string_pretty(&settings).unwrap_or_default()
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_iterations: default_max_iterations(),
            streaming: true,
            provider_options: ProviderCallOptions::default(),
            tool_max_retries: default_tool_max_retries(),
            tool_retry_backoff_ms: default_tool_retry_backoff_ms(),
            token_secret: None,
            token_ttl_ms: None,
            system_prompt: default_system_prompt(),
            model_timeout_secs: default_model_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
