use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Failures raised while running a tool. None of them abort a turn: the
/// executor turns each one into the call's output.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}
