use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ToolCallId);

impl MessageId {
    /// Fresh, creation-ordered id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl ToolCallId {
    /// Used when a provider streams a call without an id.
    pub fn generate() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4().simple()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Lifecycle of a proposed tool call. Ordered: a call only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    OutputAvailable,
}

impl ToolState {
    pub fn is_terminal(self) -> bool {
        self == ToolState::OutputAvailable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolState::InputStreaming => "input-streaming",
            ToolState::InputAvailable => "input-available",
            ToolState::OutputAvailable => "output-available",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Attempted to move a call backwards or re-resolve it.
    #[error("tool invocation state cannot move from {} to {}", .from.as_str(), .to.as_str())]
    Regression { from: ToolState, to: ToolState },
}

/// A model-proposed call to a named tool.
///
/// `state` and `output` are private so that `output` is present exactly when
/// the call is `output-available`; deserialization enforces the same rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawToolInvocation", rename_all = "camelCase")]
pub struct ToolInvocation {
    tool_call_id: ToolCallId,
    tool_name: String,
    state: ToolState,
    input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolInvocation {
    tool_call_id: ToolCallId,
    tool_name: String,
    state: ToolState,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default, deserialize_with = "present")]
    output: Option<serde_json::Value>,
}

/// A present `"output": null` is a real (null) output, not a missing one.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawToolInvocation> for ToolInvocation {
    type Error = String;

    fn try_from(raw: RawToolInvocation) -> std::result::Result<Self, Self::Error> {
        match (raw.state, raw.output.is_some()) {
            (ToolState::OutputAvailable, false) => Err(format!(
                "tool invocation {} is output-available but has no output",
                raw.tool_call_id
            )),
            (state, true) if state != ToolState::OutputAvailable => Err(format!(
                "tool invocation {} carries output while {}",
                raw.tool_call_id,
                state.as_str()
            )),
            _ => Ok(Self {
                tool_call_id: raw.tool_call_id,
                tool_name: raw.tool_name,
                state: raw.state,
                input: raw.input,
                output: raw.output,
            }),
        }
    }
}

impl ToolInvocation {
    /// A call whose arguments are still arriving.
    pub fn streaming(tool_call_id: impl Into<ToolCallId>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolState::InputStreaming,
            input: serde_json::Value::Null,
            output: None,
        }
    }

    /// A call whose input is complete and which awaits resolution.
    pub fn available(
        tool_call_id: impl Into<ToolCallId>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state: ToolState::InputAvailable,
            input,
            output: None,
        }
    }

    pub fn tool_call_id(&self) -> &ToolCallId {
        &self.tool_call_id
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn state(&self) -> ToolState {
        self.state
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.output.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn mark_input_available(
        &mut self,
        input: serde_json::Value,
    ) -> std::result::Result<(), StateError> {
        if self.state != ToolState::InputStreaming {
            return Err(StateError::Regression {
                from: self.state,
                to: ToolState::InputAvailable,
            });
        }
        self.input = input;
        self.state = ToolState::InputAvailable;
        Ok(())
    }

    /// Records the call's output. Only valid once, from `input-available`.
    pub fn complete(&mut self, output: serde_json::Value) -> std::result::Result<(), StateError> {
        if self.state != ToolState::InputAvailable {
            return Err(StateError::Regression {
                from: self.state,
                to: ToolState::OutputAvailable,
            });
        }
        self.output = Some(output);
        self.state = ToolState::OutputAvailable;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text { content: String },
    ToolInvocation(ToolInvocation),
}

impl Part {
    pub fn text(content: impl Into<String>) -> Self {
        Part::Text {
            content: content.into(),
        }
    }

    pub fn as_tool_invocation(&self) -> Option<&ToolInvocation> {
        match self {
            Part::ToolInvocation(inv) => Some(inv),
            Part::Text { .. } => None,
        }
    }

    pub fn as_tool_invocation_mut(&mut self) -> Option<&mut ToolInvocation> {
        match self {
            Part::ToolInvocation(inv) => Some(inv),
            Part::Text { .. } => None,
        }
    }

    /// Blank text carries nothing the model or user would notice.
    pub fn is_meaningful(&self) -> bool {
        match self {
            Part::Text { content } => !content.trim().is_empty(),
            Part::ToolInvocation(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant(parts: Vec<Part>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(Part::as_tool_invocation)
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { content } = part {
                out.push_str(content);
            }
        }
        out
    }
}

/// Model-facing description of a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a `ToolDefinition` after validating the name against provider constraints.
    pub fn validated(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        crate::client::validate_tool_name(&name)?;
        Ok(Self {
            name,
            description: description.into(),
            parameters,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Incremental model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamChunk {
    Delta { content: String },
    ToolCallStart { id: ToolCallId, name: String },
    ToolCallDelta { id: ToolCallId, arguments: String },
    Done { usage: Usage },
}
