use crate::store::StoreError;
use gate_llm::LlmError;
use thiserror::Error;

/// Failures that abort a turn before its history is committed.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("model transport failed: {0}")]
    Transport(#[from] LlmError),

    #[error("message store failed: {0}")]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

const MAX_PUBLIC_DETAIL_CHARS: usize = 200;

impl TurnError {
    /// Client-facing text. Backend detail stays in the logs.
    pub fn public_message(&self) -> String {
        match self {
            TurnError::Transport(LlmError::Timeout(_)) => {
                "The model took too long to respond. Please retry.".to_string()
            }
            TurnError::Transport(LlmError::Status { status, .. }) => {
                format!("The model service returned status {status}. Please retry.")
            }
            TurnError::Transport(_) => {
                "The model service is unavailable. Please retry.".to_string()
            }
            TurnError::Store(_) => "Conversation storage is unavailable. Please retry.".to_string(),
            TurnError::InvalidRequest(detail) => {
                let mut bounded: String = detail.chars().take(MAX_PUBLIC_DETAIL_CHARS).collect();
                if detail.chars().count() > MAX_PUBLIC_DETAIL_CHARS {
                    bounded.push_str("...");
                }
                format!("Invalid request: {bounded}")
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TurnError::Transport(e) => e.is_retryable(),
            TurnError::Store(_) => true,
            TurnError::InvalidRequest(_) => false,
        }
    }
}
