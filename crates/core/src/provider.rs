//! Provider trait — the abstraction over model clients.
//!
//! A Provider knows how to send a conversation to a model and get a response
//! back, either as a complete message or as a stream of chunks. Transport,
//! authentication and HTTP-level retries are the implementation's business;
//! the reasoning loop only sees this interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::message::Turn;
use crate::tool::ToolCall;

/// A single model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The full message list, system prompt first
    pub messages: Vec<Turn>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Allow-listed pass-through call options (thinking hint, effort, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,

    /// Whether the caller will consume the response as a stream
    #[serde(default)]
    pub stream: bool,
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage keyed by metric name (`input`, `output`, ...).
///
/// Usage from successive calls is combined by addition, so every key only
/// ever grows over the lifetime of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Usage(BTreeMap<String, u64>);

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of a single metric.
    pub fn with(mut self, metric: impl Into<String>, value: u64) -> Self {
        self.0.insert(metric.into(), value);
        self
    }

    /// Add every metric of `other` into `self`.
    pub fn accumulate(&mut self, other: &Usage) {
        for (metric, value) in &other.0 {
            let slot = self.0.entry(metric.clone()).or_insert(0);
            *slot = slot.saturating_add(*value);
        }
    }

    pub fn get(&self, metric: &str) -> u64 {
        self.0.get(metric).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for Usage {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated answer text
    #[serde(default)]
    pub content: String,

    /// Reasoning text, when the model exposes it separately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Tool calls requested by the model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Why generation stopped ("stop", "tool_calls", "length", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// Token usage statistics
    #[serde(default)]
    pub usage: Usage,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Partial reasoning delta
    #[serde(default)]
    pub thinking: Option<String>,

    /// Tool calls completed in this chunk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// The core Provider trait.
///
/// The reasoning loop calls `complete()` or `stream()` without knowing which
/// backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.content),
                thinking: response.thinking,
                tool_calls: response.tool_calls,
                done: true,
                usage: Some(response.usage),
                finish_reason: response.finish_reason,
            }))
            .await;
        Ok(rx)
    }
}
