//! Shared test helpers for runner tests.

use std::sync::Mutex;

use futures::StreamExt;
use waypoint_core::error::ProviderError;
use waypoint_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
use waypoint_core::tool::ToolCall;

use crate::event::{Event, EventKind};
use crate::runner::EventStream;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue and
/// records the request it was given.
pub struct ScriptedProvider {
    responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(results),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose only call fails with an API error.
    pub fn failing(message: &str) -> Self {
        Self::with_results(vec![Err(ProviderError::ApiError {
            status_code: 500,
            message: message.into(),
        })])
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!(
                "ScriptedProvider: no more responses (call #{})",
                requests.len() + 1
            );
        }
        requests.push(request);
        responses.remove(0)
    }
}

/// Streams a reply as separate thinking and content chunks.
pub struct StreamingProvider {
    deltas: Vec<String>,
    thinking: Option<String>,
}

impl StreamingProvider {
    pub fn new(deltas: Vec<String>, thinking: Option<String>) -> Self {
        Self { deltas, thinking }
    }
}

#[async_trait::async_trait]
impl Provider for StreamingProvider {
    fn name(&self) -> &str {
        "streaming_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            content: self.deltas.concat(),
            thinking: self.thinking.clone(),
            usage: usage(),
            ..Default::default()
        })
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let mut chunks = Vec::new();
        if let Some(thinking) = &self.thinking {
            chunks.push(StreamChunk {
                thinking: Some(thinking.clone()),
                ..Default::default()
            });
        }
        chunks.extend(self.deltas.iter().map(|delta| StreamChunk {
            content: Some(delta.clone()),
            ..Default::default()
        }));
        chunks.push(StreamChunk {
            done: true,
            usage: Some(usage()),
            finish_reason: Some("stop".into()),
            ..Default::default()
        });

        let (tx, rx) = tokio::sync::mpsc::channel(chunks.len());
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        Ok(rx)
    }
}

/// Streams a "." chunk every `interval` and never finishes.
pub struct DripProvider {
    interval: std::time::Duration,
}

impl DripProvider {
    pub fn new(interval: std::time::Duration) -> Self {
        Self { interval }
    }
}

#[async_trait::async_trait]
impl Provider for DripProvider {
    fn name(&self) -> &str {
        "drip_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        futures::future::pending().await
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let interval = self.interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let chunk = StreamChunk {
                    content: Some(".".into()),
                    ..Default::default()
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Never answers.
#[derive(Default)]
pub struct BlockingProvider;

#[async_trait::async_trait]
impl Provider for BlockingProvider {
    fn name(&self) -> &str {
        "blocking_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        futures::future::pending().await
    }
}

pub fn usage() -> Usage {
    Usage::new().with("input", 10).with("output", 5)
}

/// A final text response.
pub fn answer(text: &str) -> ProviderResponse {
    ProviderResponse {
        content: text.into(),
        finish_reason: Some("stop".into()),
        usage: usage(),
        ..Default::default()
    }
}

/// A response requesting `(id, name)` tool calls with `{"q": "rust"}`.
pub fn tool_call_reply(calls: &[(&str, &str)]) -> ProviderResponse {
    ProviderResponse {
        thinking: Some("need to look this up".into()),
        tool_calls: calls
            .iter()
            .map(|(id, name)| ToolCall {
                id: (*id).into(),
                name: (*name).into(),
                arguments: serde_json::json!({"q": "rust"}),
            })
            .collect(),
        finish_reason: Some("tool_calls".into()),
        usage: usage(),
        ..Default::default()
    }
}

pub async fn collect_events(stream: EventStream) -> Vec<Event> {
    stream.collect().await
}

pub fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| EventKind::event_type(e.kind)).collect()
}
