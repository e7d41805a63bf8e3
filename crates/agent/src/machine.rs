//! The reasoning state machine.
//!
//! [`transition`] is a pure function from `(state, message, env)` to
//! `(state', directives)`. It performs no I/O and never fails: rejections and
//! provider errors are expressed as state and directives. The runner owns all
//! side effects; this module only decides what should happen next.
//!
//! Lifecycle:
//!
//! ```text
//! idle ──start──▶ awaiting_llm ──model_result(answer)──▶ completed
//!                   ▲     │
//!                   │     └──model_result(tool calls)──▶ awaiting_tool
//!                   └────────────all tool_results──────────────┘
//! ```
//!
//! A provider error moves the machine to `error`. A `start` against a
//! terminal state continues the same thread as a new top-level run.

use serde::{Deserialize, Serialize};
use waypoint_core::message::{ContentBlock, Thread, Turn};
use waypoint_core::provider::{ProviderResponse, Usage};
use waypoint_core::tool::{ToolCall, ToolOutcome};

/// Where the machine is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Idle,
    AwaitingLlm,
    AwaitingTool,
    Completed,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingLlm => "awaiting_llm",
            Self::AwaitingTool => "awaiting_tool",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// A `start` is only accepted when no run is in flight.
    pub fn accepts_start(self) -> bool {
        self == Self::Idle || self.is_terminal()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    FinalAnswer,
    MaxIterations,
    Error,
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinalAnswer => "final_answer",
            Self::MaxIterations => "max_iterations",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool call requested by the model and its result, once known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: Option<ToolOutcome>,
}

/// Reasoning text captured at an iteration boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingEntry {
    pub call_id: String,
    pub iteration: u32,
    pub thinking: String,
}

/// The machine's complete state. This is exactly what a checkpoint encodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningState {
    pub status: Status,
    pub iteration: u32,
    pub thread: Thread,
    pub current_call_id: Option<String>,
    /// Call id of the accepted `start`; follow-up call ids derive from it.
    pub root_call_id: Option<String>,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub streaming_text: String,
    pub streaming_thinking: String,
    pub thinking_trace: Vec<ThinkingEntry>,
    pub usage: Usage,
    pub result: Option<String>,
    pub termination_reason: Option<TerminationReason>,
    /// Provider error text when `status` is `error`.
    pub error: Option<String>,
    /// Unix milliseconds of the accepted `start`.
    pub started_at: Option<i64>,
}

impl ReasoningState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn reset_accumulators(&mut self) {
        self.streaming_text.clear();
        self.streaming_thinking.clear();
    }
}

/// Which accumulator a streamed delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Content,
    Thinking,
}

impl StreamChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Thinking => "thinking",
        }
    }
}

/// A finished model response as seen by the machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}

impl From<ProviderResponse> for ModelReply {
    fn from(response: ProviderResponse) -> Self {
        Self {
            content: response.content,
            thinking: response.thinking,
            tool_calls: response.tool_calls,
            usage: response.usage,
            finish_reason: response.finish_reason,
        }
    }
}

/// Input to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineMessage {
    Start {
        query: String,
        call_id: String,
    },
    ModelResult {
        call_id: String,
        result: Result<ModelReply, String>,
    },
    ModelPartial {
        call_id: String,
        delta: String,
        channel: StreamChannel,
    },
    ToolResult {
        call_id: String,
        result: ToolOutcome,
    },
}

/// Output of the machine: what the runner should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Invoke the model with the full message list.
    CallModel { call_id: String, messages: Vec<Turn> },
    /// Execute one tool call.
    ExecTool {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// A `start` was rejected because a run is in flight.
    Busy { status: Status },
    /// Advisory: a follow-up model call was issued.
    IterationAdvanced { iteration: u32, call_id: String },
}

/// Per-transition environment. Kept out of the persisted state so the limit
/// is always the live config's and tokens stay small.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineEnv {
    pub system_prompt: String,
    pub max_iterations: u32,
    /// Wall clock reading for `started_at`.
    pub now_ms: i64,
}

/// Advance the machine by one message.
pub fn transition(
    state: ReasoningState,
    message: MachineMessage,
    env: &MachineEnv,
) -> (ReasoningState, Vec<Directive>) {
    match message {
        MachineMessage::Start { query, call_id } => on_start(state, query, call_id, env),
        MachineMessage::ModelPartial {
            call_id,
            delta,
            channel,
        } => (on_partial(state, &call_id, &delta, channel), Vec::new()),
        MachineMessage::ModelResult { call_id, result } => on_model_result(state, &call_id, result),
        MachineMessage::ToolResult { call_id, result } => {
            on_tool_result(state, &call_id, result, env)
        }
    }
}

/// The directives still outstanding for a state, used when resuming a
/// decoded checkpoint.
pub fn resume_directives(state: &ReasoningState, env: &MachineEnv) -> Vec<Directive> {
    match state.status {
        Status::AwaitingLlm => match &state.current_call_id {
            Some(call_id) => vec![Directive::CallModel {
                call_id: call_id.clone(),
                messages: model_messages(&state.thread, env),
            }],
            None => Vec::new(),
        },
        Status::AwaitingTool => state
            .pending_tool_calls
            .iter()
            .filter(|call| call.result.is_none())
            .map(|call| Directive::ExecTool {
                call_id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .collect(),
        Status::Idle | Status::Completed | Status::Error => Vec::new(),
    }
}

/// System prompt followed by the thread.
pub fn model_messages(thread: &Thread, env: &MachineEnv) -> Vec<Turn> {
    let mut messages = Vec::with_capacity(thread.len() + 1);
    if !env.system_prompt.is_empty() {
        messages.push(Turn::system(&env.system_prompt));
    }
    messages.extend(thread.iter().cloned());
    messages
}

fn on_start(
    mut state: ReasoningState,
    query: String,
    call_id: String,
    env: &MachineEnv,
) -> (ReasoningState, Vec<Directive>) {
    if !state.status.accepts_start() {
        let status = state.status;
        return (state, vec![Directive::Busy { status }]);
    }

    // A continuation keeps the thread and usage; everything run-scoped resets.
    state.thread.push(Turn::user(query));
    state.status = Status::AwaitingLlm;
    state.iteration = 1;
    state.current_call_id = Some(call_id.clone());
    state.root_call_id = Some(call_id.clone());
    state.pending_tool_calls.clear();
    state.thinking_trace.clear();
    state.reset_accumulators();
    state.result = None;
    state.termination_reason = None;
    state.error = None;
    state.started_at = Some(env.now_ms);

    let messages = model_messages(&state.thread, env);
    (state, vec![Directive::CallModel { call_id, messages }])
}

fn is_current_call(state: &ReasoningState, call_id: &str) -> bool {
    state.status == Status::AwaitingLlm && state.current_call_id.as_deref() == Some(call_id)
}

fn on_partial(
    mut state: ReasoningState,
    call_id: &str,
    delta: &str,
    channel: StreamChannel,
) -> ReasoningState {
    // Late deltas from a retried or cancelled call are dropped.
    if !is_current_call(&state, call_id) {
        return state;
    }
    match channel {
        StreamChannel::Content => state.streaming_text.push_str(delta),
        StreamChannel::Thinking => state.streaming_thinking.push_str(delta),
    }
    state
}

/// Record reasoning for this iteration: streamed thinking wins over thinking
/// embedded in the final response.
fn capture_thinking(
    state: &mut ReasoningState,
    call_id: &str,
    embedded: Option<&str>,
) -> Option<String> {
    let thinking = if state.streaming_thinking.is_empty() {
        embedded.unwrap_or_default().to_string()
    } else {
        state.streaming_thinking.clone()
    };
    if thinking.is_empty() {
        return None;
    }
    state.thinking_trace.push(ThinkingEntry {
        call_id: call_id.to_string(),
        iteration: state.iteration,
        thinking: thinking.clone(),
    });
    Some(thinking)
}

fn on_model_result(
    mut state: ReasoningState,
    call_id: &str,
    result: Result<ModelReply, String>,
) -> (ReasoningState, Vec<Directive>) {
    if !is_current_call(&state, call_id) {
        return (state, Vec::new());
    }

    let reply = match result {
        Ok(reply) => reply,
        Err(error) => {
            state.status = Status::Error;
            state.termination_reason = Some(TerminationReason::Error);
            state.error = Some(error);
            state.reset_accumulators();
            return (state, Vec::new());
        }
    };

    state.usage.accumulate(&reply.usage);
    let thinking = capture_thinking(&mut state, call_id, reply.thinking.as_deref());
    let text = if reply.content.is_empty() {
        state.streaming_text.clone()
    } else {
        reply.content
    };

    if reply.tool_calls.is_empty() {
        let turn = match &thinking {
            Some(thinking) => Turn::assistant_blocks(vec![
                ContentBlock::Thinking {
                    thinking: thinking.clone(),
                },
                ContentBlock::Text { text: text.clone() },
            ]),
            None => Turn::assistant(text.clone()),
        };
        state.thread.push(turn);
        state.status = Status::Completed;
        state.result = Some(text);
        state.termination_reason = Some(TerminationReason::FinalAnswer);
        state.reset_accumulators();
        return (state, Vec::new());
    }

    let calls: Vec<ToolCall> = reply
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(idx, mut call)| {
            if call.id.is_empty() {
                call.id = format!("{call_id}.tool{idx}");
            }
            call
        })
        .collect();

    let mut blocks = Vec::with_capacity(calls.len() + 2);
    if let Some(thinking) = &thinking {
        blocks.push(ContentBlock::Thinking {
            thinking: thinking.clone(),
        });
    }
    blocks.push(ContentBlock::Text { text });
    blocks.extend(calls.iter().map(|call| ContentBlock::ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
    }));
    state.thread.push(Turn::assistant_blocks(blocks));

    state.pending_tool_calls = calls
        .iter()
        .map(|call| PendingToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: None,
        })
        .collect();
    state.status = Status::AwaitingTool;
    // The captured reasoning stays outstanding for the tool phase and is
    // recorded again when the batch completes.
    state.streaming_text.clear();
    state.streaming_thinking = thinking.unwrap_or_default();

    let directives = calls
        .into_iter()
        .map(|call| Directive::ExecTool {
            call_id: call.id,
            name: call.name,
            arguments: call.arguments,
        })
        .collect();
    (state, directives)
}

fn on_tool_result(
    mut state: ReasoningState,
    call_id: &str,
    result: ToolOutcome,
    env: &MachineEnv,
) -> (ReasoningState, Vec<Directive>) {
    if state.status != Status::AwaitingTool {
        return (state, Vec::new());
    }
    let Some(idx) = state
        .pending_tool_calls
        .iter()
        .position(|call| call.id == call_id && call.result.is_none())
    else {
        return (state, Vec::new());
    };
    state.pending_tool_calls[idx].result = Some(result);

    if state.pending_tool_calls.iter().any(|call| call.result.is_none()) {
        return (state, Vec::new());
    }

    // TODO: drop this second capture once trace consumers stop relying on
    // one entry per phase boundary; it duplicates the entry written when the
    // tool calls were issued.
    if !state.streaming_thinking.is_empty() {
        let model_call_id = state.current_call_id.clone().unwrap_or_default();
        state.thinking_trace.push(ThinkingEntry {
            call_id: model_call_id,
            iteration: state.iteration,
            thinking: state.streaming_thinking.clone(),
        });
    }

    for call in std::mem::take(&mut state.pending_tool_calls) {
        let output = call
            .result
            .as_ref()
            .map(ToolOutcome::to_output)
            .unwrap_or_default();
        state.thread.push(Turn::tool_result(call.id, call.name, output));
    }

    state.iteration += 1;
    state.reset_accumulators();

    if state.iteration > env.max_iterations {
        state.status = Status::Completed;
        state.termination_reason = Some(TerminationReason::MaxIterations);
        return (state, Vec::new());
    }

    let root = state
        .root_call_id
        .clone()
        .or_else(|| state.current_call_id.clone())
        .unwrap_or_else(|| "call".to_string());
    let next_call_id = format!("{root}.{}", state.iteration);
    state.status = Status::AwaitingLlm;
    state.current_call_id = Some(next_call_id.clone());

    let messages = model_messages(&state.thread, env);
    let directives = vec![
        Directive::CallModel {
            call_id: next_call_id.clone(),
            messages,
        },
        Directive::IterationAdvanced {
            iteration: state.iteration,
            call_id: next_call_id,
        },
    ];
    (state, directives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_core::message::{Content, Role};

    fn env() -> MachineEnv {
        MachineEnv {
            system_prompt: "You are terse.".into(),
            max_iterations: 5,
            now_ms: 1_700_000_000_000,
        }
    }

    fn start(state: ReasoningState, query: &str, call_id: &str) -> (ReasoningState, Vec<Directive>) {
        transition(
            state,
            MachineMessage::Start {
                query: query.into(),
                call_id: call_id.into(),
            },
            &env(),
        )
    }

    fn answer(text: &str) -> ModelReply {
        ModelReply {
            content: text.into(),
            usage: Usage::new().with("input", 100).with("output", 50),
            ..Default::default()
        }
    }

    fn tool_reply(calls: &[(&str, &str)]) -> ModelReply {
        ModelReply {
            thinking: Some("need data".into()),
            tool_calls: calls
                .iter()
                .map(|(id, name)| ToolCall {
                    id: (*id).into(),
                    name: (*name).into(),
                    arguments: json!({"q": "rust"}),
                })
                .collect(),
            usage: Usage::new().with("input", 100).with("output", 50),
            ..Default::default()
        }
    }

    fn model_result(
        state: ReasoningState,
        call_id: &str,
        reply: ModelReply,
    ) -> (ReasoningState, Vec<Directive>) {
        transition(
            state,
            MachineMessage::ModelResult {
                call_id: call_id.into(),
                result: Ok(reply),
            },
            &env(),
        )
    }

    fn tool_ok(state: ReasoningState, call_id: &str) -> (ReasoningState, Vec<Directive>) {
        transition(
            state,
            MachineMessage::ToolResult {
                call_id: call_id.into(),
                result: ToolOutcome::Ok {
                    output: json!("found"),
                },
            },
            &env(),
        )
    }

    #[test]
    fn start_from_idle_requests_model_call() {
        let (state, directives) = start(ReasoningState::new(), "What is Rust?", "c1");
        assert_eq!(state.status, Status::AwaitingLlm);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.current_call_id.as_deref(), Some("c1"));
        assert_eq!(state.started_at, Some(env().now_ms));

        let [Directive::CallModel { call_id, messages }] = directives.as_slice() else {
            panic!("expected a single CallModel, got {directives:?}");
        };
        assert_eq!(call_id, "c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], Turn::user("What is Rust?"));
    }

    #[test]
    fn start_while_awaiting_llm_is_rejected() {
        let (state, _) = start(ReasoningState::new(), "first", "c1");
        let before = state.clone();

        let (state, directives) = start(state, "second", "c2");
        assert_eq!(state, before);
        assert_eq!(state.current_call_id.as_deref(), Some("c1"));
        let [Directive::Busy { status }] = directives.as_slice() else {
            panic!("expected Busy, got {directives:?}");
        };
        assert_eq!(*status, Status::AwaitingLlm);
        assert!(status.to_string().contains("awaiting_llm"));
    }

    #[test]
    fn partials_for_other_calls_are_ignored() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let partial = |state, call_id: &str, delta: &str, channel| {
            transition(
                state,
                MachineMessage::ModelPartial {
                    call_id: call_id.into(),
                    delta: delta.into(),
                    channel,
                },
                &env(),
            )
            .0
        };

        let state = partial(state, "c1", "Hel", StreamChannel::Content);
        let state = partial(state, "stale", "XXX", StreamChannel::Content);
        let state = partial(state, "c1", "lo", StreamChannel::Content);
        let state = partial(state, "c1", "hmm", StreamChannel::Thinking);
        assert_eq!(state.streaming_text, "Hello");
        assert_eq!(state.streaming_thinking, "hmm");
    }

    #[test]
    fn final_answer_records_thinking_and_text() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let state = transition(
            state,
            MachineMessage::ModelPartial {
                call_id: "c1".into(),
                delta: "short question".into(),
                channel: StreamChannel::Thinking,
            },
            &env(),
        )
        .0;
        let (state, directives) = model_result(state, "c1", answer("42"));

        assert!(directives.is_empty());
        assert_eq!(state.status, Status::Completed);
        assert_eq!(state.termination_reason, Some(TerminationReason::FinalAnswer));
        assert_eq!(state.result.as_deref(), Some("42"));
        assert_eq!(state.thinking_trace.len(), 1);
        assert_eq!(state.thinking_trace[0].thinking, "short question");
        assert!(state.streaming_thinking.is_empty());

        let last = state.thread.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content.thinking().as_deref(), Some("short question"));
        assert_eq!(last.content.text(), "42");
    }

    #[test]
    fn final_answer_without_thinking_is_plain_text() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, _) = model_result(state, "c1", answer("plain"));
        assert!(state.thinking_trace.is_empty());
        assert_eq!(
            state.thread.last().unwrap().content,
            Content::Text("plain".into())
        );
    }

    #[test]
    fn provider_error_terminates_with_error() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, directives) = transition(
            state,
            MachineMessage::ModelResult {
                call_id: "c1".into(),
                result: Err("upstream 500".into()),
            },
            &env(),
        );
        assert!(directives.is_empty());
        assert_eq!(state.status, Status::Error);
        assert_eq!(state.termination_reason, Some(TerminationReason::Error));
        assert_eq!(state.error.as_deref(), Some("upstream 500"));
    }

    #[test]
    fn tool_calls_fan_out_and_fold_back() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, directives) =
            model_result(state, "c1", tool_reply(&[("t1", "search"), ("t2", "fetch")]));

        assert_eq!(state.status, Status::AwaitingTool);
        assert_eq!(state.pending_tool_calls.len(), 2);
        assert!(state.pending_tool_calls.iter().all(|c| c.result.is_none()));
        let names: Vec<_> = directives
            .iter()
            .map(|d| match d {
                Directive::ExecTool { name, .. } => name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["search", "fetch"]);

        let (state, directives) = tool_ok(state, "t2");
        assert!(directives.is_empty());
        assert_eq!(state.status, Status::AwaitingTool);

        let (state, directives) = tool_ok(state, "t1");
        assert_eq!(state.status, Status::AwaitingLlm);
        assert_eq!(state.iteration, 2);
        assert!(state.pending_tool_calls.is_empty());
        assert_eq!(state.current_call_id.as_deref(), Some("c1.2"));

        match directives.as_slice() {
            [
                Directive::CallModel { call_id, messages },
                Directive::IterationAdvanced {
                    iteration: 2,
                    call_id: advanced,
                },
            ] => {
                assert_eq!(call_id, "c1.2");
                assert_eq!(advanced, "c1.2");
                // system, user, assistant(tool calls), tool, tool
                assert_eq!(messages.len(), 5);
                assert_eq!(messages[3].role, Role::Tool);
            }
            other => panic!("unexpected directives {other:?}"),
        }
    }

    #[test]
    fn thinking_is_captured_at_both_tool_phase_boundaries() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, _) = model_result(state, "c1", tool_reply(&[("t1", "search")]));
        assert_eq!(state.thinking_trace.len(), 1);

        let (state, _) = tool_ok(state, "t1");
        assert_eq!(state.thinking_trace.len(), 2);
        assert_eq!(state.thinking_trace[0], state.thinking_trace[1]);
        assert_eq!(state.thinking_trace[1].call_id, "c1");
        assert!(state.streaming_thinking.is_empty());
    }

    #[test]
    fn unknown_and_duplicate_tool_results_are_ignored() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, _) = model_result(state, "c1", tool_reply(&[("t1", "a"), ("t2", "b")]));
        let (state, _) = tool_ok(state, "t1");
        let snapshot = state.clone();

        let (state, directives) = tool_ok(state, "t1");
        assert!(directives.is_empty());
        assert_eq!(state, snapshot);

        let (state, directives) = tool_ok(state, "nope");
        assert!(directives.is_empty());
        assert_eq!(state, snapshot);
    }

    #[test]
    fn usage_accumulates_across_model_calls() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, _) = model_result(state, "c1", tool_reply(&[("t1", "search")]));
        let (state, _) = tool_ok(state, "t1");
        let (state, _) = model_result(state, "c1.2", answer("done"));

        assert_eq!(state.usage.get("input"), 200);
        assert_eq!(state.usage.get("output"), 100);
    }

    #[test]
    fn last_iteration_completes_with_max_iterations() {
        let env = MachineEnv {
            max_iterations: 1,
            ..env()
        };
        let (state, _) = transition(
            ReasoningState::new(),
            MachineMessage::Start {
                query: "q".into(),
                call_id: "c1".into(),
            },
            &env,
        );
        let (state, _) = transition(
            state,
            MachineMessage::ModelResult {
                call_id: "c1".into(),
                result: Ok(tool_reply(&[("t1", "search")])),
            },
            &env,
        );
        assert_eq!(state.iteration, env.max_iterations);

        let (state, directives) = transition(
            state,
            MachineMessage::ToolResult {
                call_id: "t1".into(),
                result: ToolOutcome::Err {
                    reason: "boom".into(),
                },
            },
            &env,
        );
        assert!(directives.is_empty());
        assert_eq!(state.status, Status::Completed);
        assert_eq!(
            state.termination_reason,
            Some(TerminationReason::MaxIterations)
        );
        assert_eq!(
            state.thread.last().unwrap().content.blocks()[0],
            ContentBlock::ToolResult {
                id: "t1".into(),
                name: "search".into(),
                output: json!("Error: boom"),
            }
        );
    }

    #[test]
    fn start_after_completion_continues_thread() {
        let (state, _) = start(ReasoningState::new(), "first", "c1");
        let (state, _) = model_result(state, "c1", tool_reply(&[("t1", "search")]));
        let (state, _) = tool_ok(state, "t1");
        let (state, _) = model_result(state, "c1.2", answer("one"));
        let history = state.thread.len();
        let usage = state.usage.clone();

        let (state, directives) = start(state, "second", "d1");
        assert_eq!(state.status, Status::AwaitingLlm);
        assert_eq!(state.iteration, 1);
        assert_eq!(state.thread.len(), history + 1);
        assert!(state.thinking_trace.is_empty());
        assert!(state.termination_reason.is_none());
        assert!(state.result.is_none());
        assert_eq!(state.usage, usage);
        assert!(matches!(
            directives.as_slice(),
            [Directive::CallModel { call_id, .. }] if call_id == "d1"
        ));
    }

    #[test]
    fn results_for_stale_calls_are_ignored() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, directives) = model_result(state, "old", answer("late"));
        assert!(directives.is_empty());
        assert_eq!(state.status, Status::AwaitingLlm);
        assert!(state.usage.is_empty());
    }

    #[test]
    fn resume_directives_reissue_outstanding_work() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        assert!(matches!(
            resume_directives(&state, &env()).as_slice(),
            [Directive::CallModel { call_id, .. }] if call_id == "c1"
        ));

        let (state, _) = model_result(state, "c1", tool_reply(&[("t1", "a"), ("t2", "b")]));
        let (state, _) = tool_ok(state, "t1");
        let outstanding = resume_directives(&state, &env());
        assert!(matches!(
            outstanding.as_slice(),
            [Directive::ExecTool { call_id, .. }] if call_id == "t2"
        ));

        assert!(resume_directives(&ReasoningState::new(), &env()).is_empty());
    }

    #[test]
    fn missing_tool_call_ids_are_derived() {
        let (state, _) = start(ReasoningState::new(), "q", "c1");
        let (state, directives) = model_result(state, "c1", tool_reply(&[("", "search")]));
        assert_eq!(state.pending_tool_calls[0].id, "c1.tool0");
        assert!(matches!(
            directives.as_slice(),
            [Directive::ExecTool { call_id, .. }] if call_id == "c1.tool0"
        ));
    }
}
