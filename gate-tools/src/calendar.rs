use crate::context::ToolContext;
use crate::error::{Result, ToolError};
use crate::traits::{Approval, Tool, ToolSpec, optional_string, require_string};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gate_llm::ConversationId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// In-process calendar, partitioned by conversation.
#[derive(Debug, Default)]
pub struct CalendarStore {
    events: DashMap<ConversationId, Vec<CalendarEvent>>,
}

impl CalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conversation_id: &ConversationId, event: CalendarEvent) {
        self.events
            .entry(conversation_id.clone())
            .or_default()
            .push(event);
    }

    /// Events for one conversation, ordered by start time.
    pub fn list(&self, conversation_id: &ConversationId) -> Vec<CalendarEvent> {
        let mut out = self
            .events
            .get(conversation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        out.sort_by_key(|e| e.start);
        out
    }
}

fn parse_time(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ToolError::Validation(format!("{field} must be an RFC 3339 timestamp: {e}")))
}

/// Reads the `schedule` object into a start/end pair.
fn parse_schedule(args: &serde_json::Value) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let Some(schedule) = args.get("schedule") else {
        return Err(ToolError::InvalidArguments("missing key: schedule".to_string()));
    };
    let kind = require_string(schedule, "kind")?;
    match kind.as_str() {
        "at" => {
            let start = parse_time("schedule.start", &require_string(schedule, "start")?)?;
            let end = match optional_string(schedule, "end")? {
                Some(raw) => Some(parse_time("schedule.end", &raw)?),
                None => None,
            };
            if let Some(end) = end {
                if end < start {
                    return Err(ToolError::Validation(
                        "schedule.end must not be before schedule.start".to_string(),
                    ));
                }
            }
            Ok((start, end))
        }
        "none" => Err(ToolError::Validation(
            "an event needs a start time; schedule.kind \"none\" cannot be created".to_string(),
        )),
        other => Err(ToolError::InvalidArguments(format!(
            "unknown schedule kind: {other}"
        ))),
    }
}

pub struct CreateCalendarEventTool {
    store: Arc<CalendarStore>,
}

impl CreateCalendarEventTool {
    pub fn new(store: Arc<CalendarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CreateCalendarEventTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "createCalendarEvent".to_string(),
            description: "Create a calendar event. The user must approve before it is created."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "title": { "type": "string", "minLength": 1 },
                    "description": { "type": "string" },
                    "schedule": {
                        "oneOf": [
                            {
                                "type": "object",
                                "additionalProperties": false,
                                "properties": {
                                    "kind": { "const": "at" },
                                    "start": { "type": "string" },
                                    "end": { "type": "string" }
                                },
                                "required": ["kind", "start"]
                            },
                            {
                                "type": "object",
                                "additionalProperties": false,
                                "properties": { "kind": { "const": "none" } },
                                "required": ["kind"]
                            }
                        ]
                    }
                },
                "required": ["title", "schedule"]
            }),
            approval: Approval::Confirmed,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_id = %ctx.conversation_id))]
    async fn execute(&self, ctx: &ToolContext, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let title = require_string(&arguments, "title")?;
        let description = optional_string(&arguments, "description")?;
        let (start, end) = parse_schedule(&arguments)?;

        let event = CalendarEvent {
            id: ulid::Ulid::new().to_string(),
            title,
            start,
            end,
            description,
        };
        self.store.insert(&ctx.conversation_id, event.clone());
        tracing::info!(event_id = %event.id, "calendar event created");
        Ok(serde_json::json!({ "status": "created", "event": event }))
    }
}

pub struct ListCalendarEventsTool {
    store: Arc<CalendarStore>,
}

impl ListCalendarEventsTool {
    pub fn new(store: Arc<CalendarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ListCalendarEventsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "listCalendarEvents".to_string(),
            description: "List the calendar events created in this conversation.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {}
            }),
            approval: Approval::Autonomous,
        }
    }

    async fn execute(&self, ctx: &ToolContext, _arguments: serde_json::Value) -> Result<serde_json::Value> {
        let events = self.store.list(&ctx.conversation_id);
        Ok(serde_json::json!({ "count": events.len(), "events": events }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(conversation: &str) -> ToolContext {
        ToolContext::new(ConversationId::from(conversation), "call_1".into())
    }

    #[tokio::test]
    async fn created_events_are_scoped_to_their_conversation() {
        let store = Arc::new(CalendarStore::new());
        let create = CreateCalendarEventTool::new(store.clone());
        let list = ListCalendarEventsTool::new(store.clone());

        let out = create
            .execute(
                &ctx("conv-a"),
                json!({
                    "title": "standup",
                    "schedule": {"kind": "at", "start": "2026-03-02T09:00:00+01:00"}
                }),
            )
            .await
            .expect("create");
        assert_eq!(out["status"], "created");
        assert_eq!(out["event"]["start"], "2026-03-02T08:00:00Z");

        let a = list.execute(&ctx("conv-a"), json!({})).await.expect("list a");
        let b = list.execute(&ctx("conv-b"), json!({})).await.expect("list b");
        assert_eq!(a["count"], 1);
        assert_eq!(b["count"], 0);
    }

    #[tokio::test]
    async fn no_schedule_is_a_validation_error() {
        let store = Arc::new(CalendarStore::new());
        let create = CreateCalendarEventTool::new(store.clone());
        let err = create
            .execute(&ctx("c"), json!({"title": "someday", "schedule": {"kind": "none"}}))
            .await
            .expect_err("no start time");
        assert!(matches!(err, ToolError::Validation(_)));
        assert!(store.list(&ConversationId::from("c")).is_empty());
    }

    #[tokio::test]
    async fn end_before_start_is_rejected() {
        let create = CreateCalendarEventTool::new(Arc::new(CalendarStore::new()));
        let err = create
            .execute(
                &ctx("c"),
                json!({
                    "title": "backwards",
                    "schedule": {
                        "kind": "at",
                        "start": "2026-03-02T10:00:00Z",
                        "end": "2026-03-02T09:00:00Z"
                    }
                }),
            )
            .await
            .expect_err("end before start");
        assert!(err.to_string().contains("schedule.end"));
    }

    #[test]
    fn list_is_sorted_by_start() {
        let store = CalendarStore::new();
        let conv = ConversationId::from("c");
        for (id, start) in [("late", "2026-01-02T00:00:00Z"), ("early", "2026-01-01T00:00:00Z")] {
            store.insert(
                &conv,
                CalendarEvent {
                    id: id.to_string(),
                    title: id.to_string(),
                    start: parse_time("start", start).expect("time"),
                    end: None,
                    description: None,
                },
            );
        }
        let ids: Vec<String> = store.list(&conv).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }
}
