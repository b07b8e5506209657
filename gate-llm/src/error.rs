use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Failures talking to the model. Every variant is a transport-level fault:
/// the caller aborts the turn and may retry it.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("model request timed out: {0}")]
    Timeout(String),

    #[error("model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),

    #[error("model stream ended before completion")]
    Truncated,
}

impl LlmError {
    /// Rate limits and server-side failures are worth retrying; a 4xx other
    /// than 408/429 means the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Unreachable(_) | LlmError::Timeout(_) | LlmError::Truncated => true,
            LlmError::Status { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            LlmError::InvalidInput(_)
            | LlmError::ResponseFormat(_)
            | LlmError::StreamParse(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        Self::Unreachable(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::LlmError;

    #[test]
    fn retryable_statuses() {
        let status = |status| LlmError::Status {
            status,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(LlmError::Truncated.is_retryable());
        assert!(!LlmError::StreamParse("x".to_string()).is_retryable());
    }
}
