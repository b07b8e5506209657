use crate::context::ToolContext;
use crate::error::Result;
use crate::traits::{Approval, Tool, ToolSpec};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};

pub struct CurrentTimeTool;

impl CurrentTimeTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CurrentTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "getCurrentTime".to_string(),
            description: "Get the current date and time in UTC.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {}
            }),
            approval: Approval::Autonomous,
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _arguments: serde_json::Value) -> Result<serde_json::Value> {
        let now = Utc::now();
        Ok(serde_json::json!({
            "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_utc_timestamp() {
        let ctx = ToolContext::new("c".into(), "call_1".into());
        let out = CurrentTimeTool::new()
            .execute(&ctx, serde_json::json!({}))
            .await
            .expect("clock never fails");
        let utc = out["utc"].as_str().expect("utc string");
        assert!(utc.ends_with('Z'));
        assert!(out["unix"].as_i64().expect("unix seconds") > 1_700_000_000);
    }
}
