//! Tool invocation with bounded waits and retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use waypoint_core::error::ToolError;
use waypoint_core::tool::{ToolCall, ToolOutcome, ToolRegistry};

use crate::config::RunConfig;

/// Result of executing one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    pub outcome: ToolOutcome,
    /// Handler invocations made; zero when the tool is unknown.
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Runs tool calls against a registry.
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    tools: Arc<ToolRegistry>,
    max_retries: u32,
    backoff: Duration,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            max_retries: 0,
            backoff: Duration::ZERO,
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.tools.clone())
            .with_retries(
                config.tool_max_retries,
                Duration::from_millis(config.tool_retry_backoff_ms),
            )
            .with_default_timeout(config.tool_timeout)
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    /// Timeout for tools that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute `call`, retrying any handler failure up to `max_retries`
    /// more times. An unknown tool fails at once.
    ///
    /// Cancellation stops the current attempt and any pending backoff; the
    /// call then reports a failure.
    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolExecution {
        let started = Instant::now();
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "Unknown tool requested");
            return ToolExecution {
                outcome: Err::<serde_json::Value, _>(ToolError::NotFound(call.name.clone())).into(),
                attempts: 0,
                duration_ms: elapsed_ms(started),
            };
        };
        let timeout = tool.timeout().unwrap_or(self.default_timeout);

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(cancelled(&call.name)),
                result = tokio::time::timeout(timeout, tool.execute(call.arguments.clone())) => {
                    result.unwrap_or_else(|_| {
                        Err(ToolError::Timeout {
                            tool_name: call.name.clone(),
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        })
                    })
                }
            };

            match attempt {
                Ok(output) => break Ok(output),
                Err(e) if attempts <= self.max_retries => {
                    warn!(
                        tool = %call.name,
                        call_id = %call.id,
                        attempt = attempts,
                        error = %e,
                        "Tool attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(e),
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        debug!(
            tool = %call.name,
            call_id = %call.id,
            attempts,
            ok = result.is_ok(),
            "Tool call finished"
        );
        ToolExecution {
            outcome: result.into(),
            attempts,
            duration_ms: elapsed_ms(started),
        }
    }
}

fn cancelled(tool_name: &str) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: tool_name.to_string(),
        reason: "cancelled".into(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
