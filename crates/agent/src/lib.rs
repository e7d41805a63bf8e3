//! The resumable reasoning loop.
//!
//! The loop follows a **call model → run tools → call model** cycle:
//!
//! 1. **Start** a run with a user query (or resume one from a checkpoint)
//! 2. **Call the model** with the system prompt and the conversation
//! 3. **If tool calls**: execute them, append the results, go back to step 2
//! 4. **If text**: the run completes with that answer
//!
//! Decisions are made by a pure state machine ([`machine`]); the
//! [`Runner`] performs the I/O and reports every step as an [`Event`].
//! After each model call the runner emits a signed checkpoint token
//! ([`checkpoint`]) from which the run can be resumed by any process holding
//! an equivalent [`RunConfig`].

pub mod checkpoint;
pub mod config;
pub mod event;
pub mod executor;
pub mod machine;
pub mod runner;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use checkpoint::{RunIdentity, TokenError, TokenPayload};
pub use config::RunConfig;
pub use event::{
    CancelledData, CheckpointData, CheckpointReason, CompletedData, Event, EventKind, FailedData,
};
pub use executor::{ToolExecution, ToolExecutor};
pub use machine::{
    Directive, MachineEnv, MachineMessage, ModelReply, PendingToolCall, ReasoningState, Status,
    StreamChannel, TerminationReason, ThinkingEntry,
};
pub use runner::{
    CancelHandle, EventStream, RunError, RunOptions, RunOutcome, Runner, StartedRun,
};

/// Wall clock in Unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
