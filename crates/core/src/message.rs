//! Conversation thread domain types.
//!
//! A [`Thread`] is the ordered history the reasoning loop sends to the model:
//! system, user, assistant and tool turns. Assistant turns can carry typed
//! content blocks so that reasoning text and tool calls survive a checkpoint
//! round-trip next to the visible answer.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The role of a turn in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

/// A typed piece of turn content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Visible text.
    Text { text: String },

    /// Model reasoning, kept apart from the answer.
    Thinking { thinking: String },

    /// A tool invocation requested by the model.
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// The output of a tool invocation.
    ToolResult {
        id: String,
        name: String,
        output: serde_json::Value,
    },
}

/// Turn content: either plain text or an ordered list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Concatenated visible text (text blocks only).
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Concatenated reasoning text, if any thinking block is present.
    pub fn thinking(&self) -> Option<String> {
        let Self::Blocks(blocks) = self else {
            return None;
        };
        let thinking: String = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                _ => None,
            })
            .collect();
        (!thinking.is_empty()).then_some(thinking)
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self {
            Self::Text(_) => &[],
            Self::Blocks(blocks) => blocks,
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Content,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Content::Text(content.into()))
    }

    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Content::Text(content.into()))
    }

    /// Create a plain-text assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Content::Text(content.into()))
    }

    /// Create an assistant turn from typed blocks.
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, Content::Blocks(blocks))
    }

    /// Create a tool-result turn answering the call `id`.
    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self::new(
            Role::Tool,
            Content::Blocks(vec![ContentBlock::ToolResult {
                id: id.into(),
                name: name.into(),
                output,
            }]),
        )
    }
}

/// Append-only conversation log.
///
/// The turns live behind an `Arc`, so cloning a thread (for example to
/// snapshot a state into a checkpoint) never copies the history. Appending
/// to a uniquely held thread mutates in place; a shared one is copied once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thread {
    turns: Arc<Vec<Turn>>,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn to the end of the log.
    pub fn push(&mut self, turn: Turn) {
        Arc::make_mut(&mut self.turns).push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl FromIterator<Turn> for Thread {
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        Self {
            turns: Arc::new(iter.into_iter().collect()),
        }
    }
}
