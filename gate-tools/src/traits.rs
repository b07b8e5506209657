use crate::context::ToolContext;
use crate::error::{Result, ToolError};
use async_trait::async_trait;
use serde::Serialize;

/// Whether a proposed call runs at once or waits for a human decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Approval {
    Autonomous,
    Confirmed,
}

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub approval: Approval,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, ctx: &ToolContext, arguments: serde_json::Value)
    -> Result<serde_json::Value>;
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other}"
        ))),
    }
}

pub(crate) fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_helpers_distinguish_missing_and_mistyped() {
        let args = json!({"title": "standup", "n": 3, "note": null});
        assert_eq!(require_string(&args, "title").expect("title"), "standup");
        assert!(require_string(&args, "missing").is_err());
        assert!(require_string(&args, "n").is_err());
        assert_eq!(optional_string(&args, "note").expect("null is none"), None);
        assert_eq!(optional_string(&args, "missing").expect("absent is none"), None);
        assert!(optional_string(&args, "n").is_err());
    }
}
