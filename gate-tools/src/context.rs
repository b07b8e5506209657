use gate_llm::{ConversationId, ToolCallId};

/// Explicit handle passed into every executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub tool_call_id: ToolCallId,
}

impl ToolContext {
    pub fn new(conversation_id: ConversationId, tool_call_id: ToolCallId) -> Self {
        Self {
            conversation_id,
            tool_call_id,
        }
    }
}
