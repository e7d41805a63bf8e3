//! Run events.
//!
//! Every observable step of a run is an [`Event`]. Events of one stream carry
//! a gapless `seq` starting at 1 and a globally unique `id`. The `data`
//! object is kind-specific; the terminal and checkpoint payloads have typed
//! mirrors ([`CompletedData`], [`FailedData`], [`CancelledData`],
//! [`CheckpointData`]) that can be read back with [`Event::data_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use waypoint_core::provider::Usage;

use crate::checkpoint::RunIdentity;
use crate::machine::{Status, TerminationReason, ThinkingEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RequestStarted,
    LlmStarted,
    LlmDelta,
    LlmCompleted,
    ToolStarted,
    ToolCompleted,
    RequestCompleted,
    RequestFailed,
    RequestCancelled,
    Checkpoint,
}

impl EventKind {
    /// Wire name for this event type.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::RequestStarted => "request_started",
            Self::LlmStarted => "llm_started",
            Self::LlmDelta => "llm_delta",
            Self::LlmCompleted => "llm_completed",
            Self::ToolStarted => "tool_started",
            Self::ToolCompleted => "tool_completed",
            Self::RequestCompleted => "request_completed",
            Self::RequestFailed => "request_failed",
            Self::RequestCancelled => "request_cancelled",
            Self::Checkpoint => "checkpoint",
        }
    }

    /// Exactly one terminal event ends every stream.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::RequestCompleted | Self::RequestFailed | Self::RequestCancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_type())
    }
}

/// One entry of a run's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position within this stream, starting at 1 with no gaps. Each stream
    /// counts on its own, so `seq` values of different streams are not
    /// comparable; use `id` to tell events apart across streams.
    pub seq: u64,
    /// Unique across streams and processes.
    pub id: String,
    pub at_ms: i64,
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub request_id: String,
    pub run_id: String,
}

impl Event {
    /// Deserialize `data` into one of the typed payloads.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }

    /// The token carried by a `checkpoint` event.
    pub fn checkpoint_token(&self) -> Option<&str> {
        if self.kind != EventKind::Checkpoint {
            return None;
        }
        self.data.get("token").and_then(|token| token.as_str())
    }

    /// The reason of a `checkpoint` event.
    pub fn checkpoint_reason(&self) -> Option<CheckpointReason> {
        if self.kind != EventKind::Checkpoint {
            return None;
        }
        self.data
            .get("reason")
            .and_then(|reason| serde_json::from_value(reason.clone()).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    AfterLlm,
    Terminal,
}

/// Payload of `request_completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedData {
    pub result: Option<String>,
    pub termination_reason: TerminationReason,
    pub usage: Usage,
    pub trace: Vec<ThinkingEntry>,
    pub iterations: u32,
}

/// Payload of `request_failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedData {
    pub error: String,
    pub termination_reason: Option<TerminationReason>,
    pub usage: Usage,
}

/// Payload of `request_cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledData {
    pub reason: String,
    pub usage: Usage,
}

/// Payload of `checkpoint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub reason: CheckpointReason,
    /// Absent only when issuing failed; `error` then says why.
    pub token: Option<String>,
    pub status: Status,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The consumer went away; production must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Detached;

/// Numbers and delivers the events of one stream.
pub(crate) struct EventEmitter {
    seq: u64,
    identity: RunIdentity,
    tx: mpsc::Sender<Event>,
    detached: CancellationToken,
}

impl EventEmitter {
    pub(crate) fn new(
        identity: RunIdentity,
        tx: mpsc::Sender<Event>,
        detached: CancellationToken,
    ) -> Self {
        Self {
            seq: 0,
            identity,
            tx,
            detached,
        }
    }

    pub(crate) fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Deliver one event, waiting for the consumer to make room.
    pub(crate) async fn emit(
        &mut self,
        kind: EventKind,
        data: impl Serialize,
    ) -> Result<(), Detached> {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            serde_json::json!({ "serialization_error": e.to_string() })
        });
        self.seq += 1;
        let event = Event {
            seq: self.seq,
            id: uuid::Uuid::new_v4().to_string(),
            at_ms: crate::now_ms(),
            kind,
            data,
            request_id: self.identity.request_id.clone(),
            run_id: self.identity.run_id.clone(),
        };

        tokio::select! {
            biased;
            _ = self.detached.cancelled() => Err(Detached),
            sent = self.tx.send(event) => sent.map_err(|_| Detached),
        }
    }
}
