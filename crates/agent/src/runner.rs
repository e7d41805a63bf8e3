//! The streaming runner.
//!
//! A [`Runner`] drives the state machine against a live model client and
//! the tool map of a [`RunConfig`]. Each run executes on its own task and
//! reports progress as an ordered [`EventStream`]:
//!
//! ```text
//! request_started
//!   llm_started  llm_delta*  llm_completed  checkpoint(after_llm)
//!   tool_started*  tool_completed*
//!   llm_started  ...
//! request_completed | request_failed | request_cancelled
//! checkpoint(terminal)
//! ```
//!
//! The event channel holds a single event, so a run never gets ahead of its
//! consumer. Dropping the stream detaches the consumer: the run's task stops
//! at its next suspension point and in-flight model and tool calls are
//! dropped with it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use waypoint_core::error::ProviderError;
use waypoint_core::provider::{Provider, ProviderRequest, Usage};
use waypoint_core::tool::ToolCall;

use crate::checkpoint::{self, RunIdentity, TokenError, TokenPayload};
use crate::config::RunConfig;
use crate::event::{
    CancelledData, CheckpointData, CheckpointReason, CompletedData, Detached, Event,
    EventEmitter, EventKind, FailedData,
};
use crate::executor::ToolExecutor;
use crate::machine::{
    self, Directive, MachineMessage, ModelReply, ReasoningState, Status, StreamChannel,
    TerminationReason, ThinkingEntry,
};

/// Per-call identifiers. Anything left unset is generated.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub request_id: Option<String>,
    /// Call id for the initial model call of a fresh start.
    pub call_id: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    fn identity(&self, fallback: Option<RunIdentity>) -> RunIdentity {
        let fallback = fallback.unwrap_or_else(RunIdentity::generate);
        RunIdentity::new(
            self.run_id.clone().unwrap_or(fallback.run_id),
            self.request_id.clone().unwrap_or(fallback.request_id),
        )
    }

    fn call_id(&self) -> String {
        self.call_id
            .clone()
            .unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4().simple()))
    }
}

/// The events of one run. Dropping it stops the run.
pub struct EventStream {
    events: ReceiverStream<Event>,
    run_id: String,
    request_id: String,
    _detach: DropGuard,
}

impl EventStream {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("run_id", &self.run_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Cooperative cancellation of a live run.
///
/// Unlike dropping the stream, cancelling lets the run report
/// `request_cancelled` and a final checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancelHandle {
    /// Request cancellation. Only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

/// A run started with [`Runner::start`].
#[derive(Debug)]
pub struct StartedRun {
    pub run_id: String,
    pub request_id: String,
    pub events: EventStream,
    pub cancel: CancelHandle,
}

/// A run reduced to its terminal facts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub result: Option<String>,
    pub termination_reason: Option<TerminationReason>,
    pub usage: Usage,
    pub trace: Vec<ThinkingEntry>,
    /// Token of the terminal checkpoint.
    pub final_token: Option<String>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
}

impl RunOutcome {
    /// Drain `events` and keep the terminal facts.
    pub async fn from_events(mut events: EventStream) -> Result<Self, RunError> {
        let mut outcome: Option<Self> = None;
        let mut final_token = None;

        while let Some(event) = events.next().await {
            match event.kind {
                EventKind::RequestCompleted => {
                    if let Some(data) = event.data_as::<CompletedData>() {
                        outcome = Some(Self {
                            result: data.result,
                            termination_reason: Some(data.termination_reason),
                            usage: data.usage,
                            trace: data.trace,
                            final_token: None,
                            error: None,
                        });
                    }
                }
                EventKind::RequestFailed => {
                    if let Some(data) = event.data_as::<FailedData>() {
                        outcome = Some(Self {
                            result: None,
                            termination_reason: data.termination_reason,
                            usage: data.usage,
                            trace: Vec::new(),
                            final_token: None,
                            error: Some(data.error),
                        });
                    }
                }
                EventKind::RequestCancelled => {
                    if let Some(data) = event.data_as::<CancelledData>() {
                        outcome = Some(Self {
                            result: None,
                            termination_reason: Some(TerminationReason::Cancelled),
                            usage: data.usage,
                            trace: Vec::new(),
                            final_token: None,
                            error: Some(data.reason),
                        });
                    }
                }
                EventKind::Checkpoint => {
                    if let Some(token) = event.checkpoint_token() {
                        final_token = Some(token.to_string());
                    }
                }
                _ => {}
            }
        }

        let mut outcome = outcome.ok_or(RunError::Incomplete)?;
        outcome.final_token = final_token;
        Ok(outcome)
    }

    /// The outcome recorded in a terminal checkpoint.
    fn from_payload(payload: TokenPayload, token: &str) -> Self {
        let error = if payload.is_cancelled() {
            Some(
                payload
                    .cancel_reason
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string()),
            )
        } else {
            payload.state.error.clone()
        };
        let state = payload.state;
        Self {
            result: state.result,
            termination_reason: state.termination_reason,
            usage: state.usage,
            trace: state.thinking_trace,
            final_token: Some(token.to_string()),
            error,
        }
    }
}

/// Errors from the aggregate entry points.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("event stream ended without a terminal event")]
    Incomplete,
}

/// Spawns and supervises runs against one model client.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct Runner {
    provider: Arc<dyn Provider>,
    tracker: TaskTracker,
}

impl Runner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            tracker: TaskTracker::new(),
        }
    }

    /// Number of runs whose task is still alive.
    pub fn active_runs(&self) -> usize {
        self.tracker.len()
    }

    /// Start a fresh run for `query`.
    pub fn stream(&self, query: impl Into<String>, config: &RunConfig, opts: RunOptions) -> EventStream {
        self.start(query, config, opts).events
    }

    /// Start a fresh run and keep a handle for cancelling it.
    pub fn start(&self, query: impl Into<String>, config: &RunConfig, opts: RunOptions) -> StartedRun {
        let entry = Entry::Start {
            state: ReasoningState::new(),
            query: query.into(),
            call_id: opts.call_id(),
        };
        self.spawn(entry, config, opts.identity(None))
    }

    /// Ask a new question on top of an existing conversation state.
    ///
    /// A state with a run still in flight yields `request_failed` with a
    /// busy error and is left untouched.
    pub fn follow_up(
        &self,
        state: ReasoningState,
        query: impl Into<String>,
        config: &RunConfig,
        opts: RunOptions,
    ) -> EventStream {
        let entry = Entry::Start {
            state,
            query: query.into(),
            call_id: opts.call_id(),
        };
        self.spawn(entry, config, opts.identity(None)).events
    }

    /// Resume the outstanding work of `state`.
    pub fn stream_from_state(
        &self,
        state: ReasoningState,
        config: &RunConfig,
        opts: RunOptions,
    ) -> EventStream {
        let entry = Entry::Resume {
            state,
            cancel_reason: None,
        };
        self.spawn(entry, config, opts.identity(None)).events
    }

    /// Decode `token` and resume the run it describes. The token's run and
    /// request ids are kept unless `opts` overrides them.
    pub fn continue_run(
        &self,
        token: &str,
        config: &RunConfig,
        opts: RunOptions,
    ) -> Result<EventStream, TokenError> {
        let payload = checkpoint::decode(token, config)?;
        let identity = opts.identity(Some(payload.identity()));
        info!(
            run_id = %identity.run_id,
            request_id = %identity.request_id,
            status = %payload.state.status,
            "Continuing run from checkpoint"
        );
        let entry = Entry::Resume {
            state: payload.state,
            cancel_reason: payload.cancel_reason,
        };
        Ok(self.spawn(entry, config, identity).events)
    }

    /// Run `query` to completion.
    pub async fn run(
        &self,
        query: impl Into<String>,
        config: &RunConfig,
        opts: RunOptions,
    ) -> Result<RunOutcome, RunError> {
        RunOutcome::from_events(self.stream(query, config, opts)).await
    }

    /// The outcome behind `token`: read straight from a terminal token,
    /// otherwise obtained by resuming the run to its end.
    pub async fn collect(&self, token: &str, config: &RunConfig) -> Result<RunOutcome, RunError> {
        let payload = checkpoint::decode(token, config)?;
        if payload.state.is_terminal() || payload.is_cancelled() {
            debug!(run_id = %payload.run_id, "Collecting terminal checkpoint");
            return Ok(RunOutcome::from_payload(payload, token));
        }

        let identity = payload.identity();
        let entry = Entry::Resume {
            state: payload.state,
            cancel_reason: payload.cancel_reason,
        };
        RunOutcome::from_events(self.spawn(entry, config, identity).events).await
    }

    /// Mark the run behind `token` cancelled without resuming it.
    pub fn cancel(&self, token: &str, config: &RunConfig, reason: &str) -> Result<String, TokenError> {
        checkpoint::mark_cancelled(token, config, reason)
    }

    fn spawn(&self, entry: Entry, config: &RunConfig, identity: RunIdentity) -> StartedRun {
        let (tx, rx) = mpsc::channel(1);
        let detached = CancellationToken::new();
        let cancel = CancelHandle::default();

        let task = RunTask {
            provider: self.provider.clone(),
            config: Arc::new(config.clone()),
            executor: ToolExecutor::from_config(config),
            emitter: EventEmitter::new(identity.clone(), tx, detached.clone()),
            state: ReasoningState::new(),
            detached: detached.clone(),
            cancel: cancel.clone(),
        };
        self.tracker.spawn(task.run(entry));

        StartedRun {
            run_id: identity.run_id.clone(),
            request_id: identity.request_id.clone(),
            events: EventStream {
                events: ReceiverStream::new(rx),
                run_id: identity.run_id,
                request_id: identity.request_id,
                _detach: detached.drop_guard(),
            },
            cancel,
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("provider", &self.provider.name())
            .field("active_runs", &self.tracker.len())
            .finish()
    }
}

enum Entry {
    Start {
        state: ReasoningState,
        query: String,
        call_id: String,
    },
    Resume {
        state: ReasoningState,
        cancel_reason: Option<String>,
    },
}

/// Why production stopped early.
enum Interrupt {
    Detached,
    Cancelled,
}

impl From<Detached> for Interrupt {
    fn from(_: Detached) -> Self {
        Self::Detached
    }
}

/// One run's producer. Owns the state; nothing else touches it.
struct RunTask {
    provider: Arc<dyn Provider>,
    config: Arc<RunConfig>,
    executor: ToolExecutor,
    emitter: EventEmitter,
    state: ReasoningState,
    detached: CancellationToken,
    cancel: CancelHandle,
}

impl RunTask {
    async fn run(mut self, entry: Entry) {
        let run_id = self.emitter.identity().run_id.clone();
        match self.drive(entry).await {
            Ok(()) => {}
            Err(Interrupt::Detached) => {
                info!(run_id = %run_id, "Consumer detached, run stopped");
            }
            Err(Interrupt::Cancelled) => {
                let reason = self.cancel.reason();
                if self.finish_cancelled(reason).await.is_err() {
                    debug!(run_id = %run_id, "Consumer detached during cancellation");
                }
            }
        }
    }

    async fn drive(&mut self, entry: Entry) -> Result<(), Interrupt> {
        let mut directives = match entry {
            Entry::Start {
                state,
                query,
                call_id,
            } => {
                self.state = state;
                info!(
                    run_id = %self.emitter.identity().run_id,
                    request_id = %self.emitter.identity().request_id,
                    call_id = %call_id,
                    model = %self.config.model,
                    "Starting run"
                );
                self.emit(
                    EventKind::RequestStarted,
                    json!({
                        "model": self.config.model,
                        "resumed": false,
                        "status": self.state.status,
                        "query": query,
                    }),
                )
                .await?;

                let directives = self.apply(MachineMessage::Start { query, call_id });
                if let Some(Directive::Busy { status }) = directives.first() {
                    return self.finish_busy(*status).await;
                }
                directives
            }
            Entry::Resume {
                state,
                cancel_reason,
            } => {
                self.state = state;
                self.emit(
                    EventKind::RequestStarted,
                    json!({
                        "model": self.config.model,
                        "resumed": true,
                        "status": self.state.status,
                        "iteration": self.state.iteration,
                    }),
                )
                .await?;

                if self.state.termination_reason == Some(TerminationReason::Cancelled) {
                    let reason = cancel_reason.unwrap_or_else(|| "cancelled".to_string());
                    return self.finish_cancelled(reason).await;
                }
                let env = self.config.env(crate::now_ms());
                machine::resume_directives(&self.state, &env)
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let mut model_call = None;
            let mut tool_calls = Vec::new();
            for directive in directives.drain(..) {
                match directive {
                    Directive::CallModel { call_id, messages } => {
                        model_call = Some((call_id, messages));
                    }
                    Directive::ExecTool {
                        call_id,
                        name,
                        arguments,
                    } => tool_calls.push(ToolCall {
                        id: call_id,
                        name,
                        arguments,
                    }),
                    Directive::IterationAdvanced { iteration, call_id } => {
                        debug!(iteration, call_id = %call_id, "Iteration advanced");
                    }
                    Directive::Busy { .. } => {}
                }
            }

            directives = if let Some((call_id, messages)) = model_call {
                self.call_model(call_id, messages).await?
            } else if !tool_calls.is_empty() {
                self.run_tools(tool_calls).await?
            } else {
                break;
            };
        }

        self.finish().await
    }

    fn apply(&mut self, message: MachineMessage) -> Vec<Directive> {
        let env = self.config.env(crate::now_ms());
        let state = std::mem::take(&mut self.state);
        let (state, directives) = machine::transition(state, message, &env);
        self.state = state;
        directives
    }

    /// Await `fut` unless the consumer detaches or the run is cancelled first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.detached.cancelled() => Err(Interrupt::Detached),
            _ = self.cancel.token.cancelled() => Err(Interrupt::Cancelled),
            output = fut => Ok(output),
        }
    }

    async fn emit(&mut self, kind: EventKind, data: impl serde::Serialize) -> Result<(), Interrupt> {
        Ok(self.emitter.emit(kind, data).await?)
    }

    async fn call_model(
        &mut self,
        call_id: String,
        messages: Vec<waypoint_core::message::Turn>,
    ) -> Result<Vec<Directive>, Interrupt> {
        let iteration = self.state.iteration;
        debug!(
            run_id = %self.emitter.identity().run_id,
            call_id = %call_id,
            iteration,
            messages = messages.len(),
            "Calling model"
        );
        self.emit(
            EventKind::LlmStarted,
            json!({
                "call_id": call_id,
                "iteration": iteration,
                "model": self.config.model,
                "streaming": self.config.streaming,
            }),
        )
        .await?;

        let request = ProviderRequest {
            model: self.config.model.clone(),
            messages,
            tools: self.config.tools.definitions(),
            options: self.config.provider_options.to_map(),
            stream: self.config.streaming,
        };
        let result = if self.config.streaming {
            self.stream_model(&call_id, request).await?
        } else {
            self.complete_model(request).await?
        };

        let summary = match &result {
            Ok(reply) => json!({
                "call_id": call_id,
                "iteration": iteration,
                "ok": true,
                "finish_reason": reply.finish_reason,
                "usage": reply.usage,
                "tool_calls": reply.tool_calls.len(),
            }),
            Err(error) => {
                warn!(call_id = %call_id, error = %error, "Model call failed");
                json!({
                    "call_id": call_id,
                    "iteration": iteration,
                    "ok": false,
                    "error": error,
                })
            }
        };
        let directives = self.apply(MachineMessage::ModelResult { call_id, result });
        self.emit(EventKind::LlmCompleted, summary).await?;
        self.checkpoint(CheckpointReason::AfterLlm).await?;
        Ok(directives)
    }

    async fn complete_model(
        &self,
        request: ProviderRequest,
    ) -> Result<Result<ModelReply, String>, Interrupt> {
        let timeout = self.config.model_timeout;
        let response = self
            .guard(tokio::time::timeout(timeout, self.provider.complete(request)))
            .await?;
        Ok(match response {
            Ok(Ok(response)) => Ok(ModelReply::from(response)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(timeout_error(timeout)),
        })
    }

    /// The whole call, from opening the stream to its last chunk, shares one
    /// deadline.
    async fn stream_model(
        &mut self,
        call_id: &str,
        request: ProviderRequest,
    ) -> Result<Result<ModelReply, String>, Interrupt> {
        let timeout = self.config.model_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let opened = self
            .guard(tokio::time::timeout_at(deadline, self.provider.stream(request)))
            .await?;
        let mut chunks = match opened {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => return Ok(Err(e.to_string())),
            Err(_) => return Ok(Err(timeout_error(timeout))),
        };

        let mut tool_calls = Vec::new();
        let mut usage = Usage::new();
        let mut finish_reason = None;
        loop {
            let next = self
                .guard(tokio::time::timeout_at(deadline, chunks.recv()))
                .await?;
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Ok(Err(e.to_string())),
                Ok(None) => break,
                Err(_) => return Ok(Err(timeout_error(timeout))),
            };

            if let Some(delta) = chunk.thinking.filter(|d| !d.is_empty()) {
                self.delta(call_id, delta, StreamChannel::Thinking).await?;
            }
            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                self.delta(call_id, delta, StreamChannel::Content).await?;
            }
            tool_calls.extend(chunk.tool_calls);
            if let Some(chunk_usage) = chunk.usage {
                usage = chunk_usage;
            }
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason;
            }
            if chunk.done {
                break;
            }
        }

        Ok(Ok(ModelReply {
            content: self.state.streaming_text.clone(),
            thinking: None,
            tool_calls,
            usage,
            finish_reason,
        }))
    }

    async fn delta(
        &mut self,
        call_id: &str,
        delta: String,
        channel: StreamChannel,
    ) -> Result<(), Interrupt> {
        self.apply(MachineMessage::ModelPartial {
            call_id: call_id.to_string(),
            delta: delta.clone(),
            channel,
        });
        self.emit(
            EventKind::LlmDelta,
            json!({ "call_id": call_id, "channel": channel, "delta": delta }),
        )
        .await
    }

    /// Execute one batch concurrently; results are applied in completion order.
    async fn run_tools(&mut self, calls: Vec<ToolCall>) -> Result<Vec<Directive>, Interrupt> {
        for call in &calls {
            self.emit(
                EventKind::ToolStarted,
                json!({
                    "call_id": call.id,
                    "name": call.name,
                    "arguments": call.arguments,
                    "iteration": self.state.iteration,
                }),
            )
            .await?;
        }

        let mut running: FuturesUnordered<_> = calls
            .into_iter()
            .map(|call| {
                let executor = self.executor.clone();
                let cancel = self.detached.clone();
                async move {
                    let execution = executor.execute(&call, &cancel).await;
                    (call, execution)
                }
            })
            .collect();

        let mut directives = Vec::new();
        while let Some((call, execution)) = self.guard(running.next()).await? {
            self.emit(
                EventKind::ToolCompleted,
                json!({
                    "call_id": call.id,
                    "name": call.name,
                    "ok": execution.outcome.is_ok(),
                    "result": execution.outcome,
                    "attempts": execution.attempts,
                    "duration_ms": execution.duration_ms,
                }),
            )
            .await?;
            directives.extend(self.apply(MachineMessage::ToolResult {
                call_id: call.id,
                result: execution.outcome,
            }));
        }
        Ok(directives)
    }

    async fn checkpoint(&mut self, reason: CheckpointReason) -> Result<(), Interrupt> {
        let token = checkpoint::issue(&self.state, &self.config, self.emitter.identity());
        self.emit_checkpoint(reason, token).await
    }

    async fn emit_checkpoint(
        &mut self,
        reason: CheckpointReason,
        token: Result<String, TokenError>,
    ) -> Result<(), Interrupt> {
        let (token, error) = match token {
            Ok(token) => (Some(token), None),
            Err(e) => {
                warn!(error = %e, "Failed to issue checkpoint token");
                (None, Some(e.to_string()))
            }
        };
        let data = CheckpointData {
            reason,
            token,
            status: self.state.status,
            iteration: self.state.iteration,
            error,
        };
        self.emit(EventKind::Checkpoint, data).await
    }

    async fn finish(&mut self) -> Result<(), Interrupt> {
        let state = &self.state;
        let (kind, data) = match state.status {
            Status::Completed => {
                let termination_reason = state
                    .termination_reason
                    .unwrap_or(TerminationReason::FinalAnswer);
                let data = CompletedData {
                    result: state.result.clone(),
                    termination_reason,
                    usage: state.usage.clone(),
                    trace: state.thinking_trace.clone(),
                    iterations: state.iteration,
                };
                (EventKind::RequestCompleted, serde_json::to_value(data))
            }
            Status::Error => {
                let data = FailedData {
                    error: state
                        .error
                        .clone()
                        .unwrap_or_else(|| "model call failed".to_string()),
                    termination_reason: state
                        .termination_reason
                        .or(Some(TerminationReason::Error)),
                    usage: state.usage.clone(),
                };
                (EventKind::RequestFailed, serde_json::to_value(data))
            }
            status => {
                let data = FailedData {
                    error: format!("nothing to resume from {status} state"),
                    termination_reason: None,
                    usage: state.usage.clone(),
                };
                (EventKind::RequestFailed, serde_json::to_value(data))
            }
        };
        info!(
            run_id = %self.emitter.identity().run_id,
            outcome = kind.event_type(),
            iterations = self.state.iteration,
            "Run finished"
        );

        self.emit(kind, data.unwrap_or_default()).await?;
        self.checkpoint(CheckpointReason::Terminal).await
    }

    async fn finish_busy(&mut self, status: Status) -> Result<(), Interrupt> {
        warn!(
            run_id = %self.emitter.identity().run_id,
            status = %status,
            "Start rejected, a run is already in flight"
        );
        let data = FailedData {
            error: format!("busy {status}"),
            termination_reason: None,
            usage: self.state.usage.clone(),
        };
        self.emit(EventKind::RequestFailed, data).await?;
        self.checkpoint(CheckpointReason::Terminal).await
    }

    async fn finish_cancelled(&mut self, reason: String) -> Result<(), Interrupt> {
        self.state.termination_reason = Some(TerminationReason::Cancelled);
        if !self.state.status.is_terminal() {
            self.state.status = Status::Completed;
        }
        info!(
            run_id = %self.emitter.identity().run_id,
            reason = %reason,
            "Run cancelled"
        );

        let data = CancelledData {
            reason: reason.clone(),
            usage: self.state.usage.clone(),
        };
        self.emit(EventKind::RequestCancelled, data).await?;
        let token = checkpoint::issue_cancelled(
            &self.state,
            &self.config,
            self.emitter.identity(),
            &reason,
        );
        self.emit_checkpoint(CheckpointReason::Terminal, token).await
    }
}

fn timeout_error(timeout: Duration) -> String {
    ProviderError::Timeout(format!("no response within {}ms", timeout.as_millis())).to_string()
}
