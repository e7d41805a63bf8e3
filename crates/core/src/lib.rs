//! # Waypoint Core
//!
//! Domain types, traits, and error definitions for the Waypoint reasoning
//! loop. This crate has no runtime of its own: it defines the conversation
//! model and the two seams the loop consumes, model clients
//! ([`Provider`]) and tool handlers ([`Tool`]).

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, ToolError};
pub use message::{Content, ContentBlock, Role, Thread, Turn};
pub use provider::{
    Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage,
};
pub use tool::{Tool, ToolCall, ToolOutcome, ToolRegistry};
