//! Immutable run configuration.
//!
//! A [`RunConfig`] is everything a run needs besides the model client: the
//! model identifier, the tool map, loop limits, retry policy and the token
//! signing material. It is shared read-only between concurrent runs.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use waypoint_config::{ConfigError, ProviderCallOptions, RunSettings};
use waypoint_core::tool::ToolRegistry;

use crate::machine::MachineEnv;

/// Run configuration.
#[derive(Clone)]
pub struct RunConfig {
    pub model: String,
    pub tools: Arc<ToolRegistry>,
    pub max_iterations: u32,
    pub streaming: bool,
    pub provider_options: ProviderCallOptions,
    pub tool_max_retries: u32,
    pub tool_retry_backoff_ms: u64,
    pub token_secret: Arc<[u8]>,
    pub token_ttl_ms: Option<u64>,
    pub system_prompt: String,
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
}

impl RunConfig {
    /// Create a config for `model` signing tokens with `secret`; every other
    /// field takes the [`RunSettings`] default.
    ///
    /// An empty `secret` is accepted here but refused at signing time: every
    /// checkpoint of such a config fails with
    /// [`TokenError::MissingSecret`](crate::checkpoint::TokenError::MissingSecret).
    pub fn new(model: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        let defaults = RunSettings::default();
        Self {
            model: model.into().trim().to_string(),
            tools: Arc::new(ToolRegistry::new()),
            max_iterations: defaults.max_iterations,
            streaming: defaults.streaming,
            provider_options: defaults.provider_options,
            tool_max_retries: defaults.tool_max_retries,
            tool_retry_backoff_ms: defaults.tool_retry_backoff_ms,
            token_secret: Arc::from(secret.as_ref()),
            token_ttl_ms: None,
            system_prompt: defaults.system_prompt,
            model_timeout: Duration::from_secs(defaults.model_timeout_secs),
            tool_timeout: Duration::from_secs(defaults.tool_timeout_secs),
        }
    }

    /// Build a config from validated settings and a tool map.
    pub fn from_settings(settings: &RunSettings, tools: ToolRegistry) -> Result<Self, ConfigError> {
        settings.validate()?;
        let secret = settings.token_secret.as_deref().ok_or_else(|| {
            ConfigError::ValidationError("token_secret is required to issue checkpoints".into())
        })?;

        Ok(Self::new(&settings.model, secret)
            .with_tools(tools)
            .with_max_iterations(settings.max_iterations)
            .with_streaming(settings.streaming)
            .with_provider_options(settings.provider_options)
            .with_tool_retries(settings.tool_max_retries, settings.tool_retry_backoff_ms)
            .with_token_ttl_ms(settings.token_ttl_ms)
            .with_system_prompt(&settings.system_prompt)
            .with_model_timeout(Duration::from_secs(settings.model_timeout_secs))
            .with_tool_timeout(Duration::from_secs(settings.tool_timeout_secs)))
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// Set the iteration limit (at least 1).
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_provider_options(mut self, options: ProviderCallOptions) -> Self {
        self.provider_options = options;
        self
    }

    /// Set call options from an open map. Keys outside the allow-list are
    /// dropped.
    pub fn with_provider_option_map(
        mut self,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.provider_options = ProviderCallOptions::from_map(options);
        self
    }

    /// Set the tool retry policy: `max_retries` extra attempts, `backoff_ms` apart.
    pub fn with_tool_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.tool_max_retries = max_retries;
        self.tool_retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the token lifetime. `None` (or zero) disables expiry.
    pub fn with_token_ttl_ms(mut self, ttl_ms: Option<u64>) -> Self {
        self.token_ttl_ms = ttl_ms.filter(|ttl| *ttl > 0);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Digest of the settings a checkpoint must not drift from: model, tool
    /// names and system prompt.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "model": self.model,
            "tools": self.tools.names(),
            "system_prompt": self.system_prompt,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// The per-transition environment for the state machine.
    pub fn env(&self, now_ms: i64) -> MachineEnv {
        MachineEnv {
            system_prompt: self.system_prompt.clone(),
            max_iterations: self.max_iterations,
            now_ms,
        }
    }
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("model", &self.model)
            .field("tools", &self.tools.names())
            .field("max_iterations", &self.max_iterations)
            .field("streaming", &self.streaming)
            .field("provider_options", &self.provider_options)
            .field("tool_max_retries", &self.tool_max_retries)
            .field("tool_retry_backoff_ms", &self.tool_retry_backoff_ms)
            .field("token_secret", &"[REDACTED]")
            .field("token_ttl_ms", &self.token_ttl_ms)
            .field("system_prompt", &self.system_prompt)
            .field("model_timeout", &self.model_timeout)
            .field("tool_timeout", &self.tool_timeout)
            .finish()
    }
}
