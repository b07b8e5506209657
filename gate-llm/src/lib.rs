//! Conversation data model and streaming client for OpenAI-compatible
//! chat completion endpoints.
//!
//! The step loop depends only on [`LanguageModel`]; [`LlmClient`] is the
//! production implementation.

mod client;
mod error;
mod openai;
mod types;

pub use client::{ChunkStream, DEFAULT_BASE_URL, LanguageModel, LlmClient, ModelRequest, validate_tool_name};
pub use error::{LlmError, Result};
pub use types::{
    ConversationId, Message, MessageId, Part, Role, StateError, StreamChunk, ToolCallId,
    ToolDefinition, ToolInvocation, ToolState, Usage,
};
