//! Ordered outbound event stream for one turn.
//!
//! A single producer (the turn task) writes into a bounded channel; the HTTP
//! body drains it in order. Nothing is buffered or reordered in between.

use axum::response::sse::Event;
use gate_llm::{ConversationId, Message, ToolCallId, ToolInvocation, ToolState};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Done,
    ToolPending,
    StepLimit,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    TextDelta {
        delta: String,
    },

    ToolInvocationDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: ToolCallId,
        #[serde(rename = "toolName")]
        tool_name: String,
        state: ToolState,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },

    Finish {
        reason: FinishReason,
    },

    /// The persisted history at the end of the turn.
    Messages {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },

    Error {
        message: String,
    },
}

impl StreamEvent {
    /// Snapshot of a call's current state. Input is omitted while it is
    /// still streaming.
    pub fn tool_delta(inv: &ToolInvocation) -> Self {
        let input = match inv.state() {
            ToolState::InputStreaming => None,
            _ => Some(inv.input().clone()),
        };
        StreamEvent::ToolInvocationDelta {
            tool_call_id: inv.tool_call_id().clone(),
            tool_name: inv.tool_name().to_string(),
            state: inv.state(),
            input,
            output: inv.output().cloned(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::ToolInvocationDelta { .. } => "tool-invocation-delta",
            StreamEvent::Finish { .. } => "finish",
            StreamEvent::Messages { .. } => "messages",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn to_sse(&self) -> Result<Event, axum::Error> {
        Event::default().event(self.name()).json_data(self)
    }
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Returns false once the consumer is gone; the event is dropped.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(event = err.0.name(), "event consumer gone; dropping event");
                false
            }
        }
    }

    pub async fn emit_all(&self, events: impl IntoIterator<Item = StreamEvent>) {
        for event in events {
            if !self.emit(event).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_delta_wire_shape() {
        let mut inv = ToolInvocation::available("c1", "getCurrentTime", json!({}));
        inv.complete(json!("12:00")).expect("complete");
        let v = serde_json::to_value(StreamEvent::tool_delta(&inv)).expect("serialize");
        assert_eq!(
            v,
            json!({
                "type": "tool-invocation-delta",
                "toolCallId": "c1",
                "toolName": "getCurrentTime",
                "state": "output-available",
                "input": {},
                "output": "12:00"
            })
        );

        let streaming = ToolInvocation::streaming("c2", "createCalendarEvent");
        let v = serde_json::to_value(StreamEvent::tool_delta(&streaming)).expect("serialize");
        assert!(v.get("input").is_none());
        assert_eq!(v["state"], "input-streaming");
    }

    #[test]
    fn finish_reason_is_kebab_case() {
        let v = serde_json::to_value(StreamEvent::Finish {
            reason: FinishReason::ToolPending,
        })
        .expect("serialize");
        assert_eq!(v, json!({"type": "finish", "reason": "tool-pending"}));
        assert_eq!(
            StreamEvent::Finish {
                reason: FinishReason::StepLimit
            }
            .name(),
            "finish"
        );
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (sink, mut rx) = EventSink::channel(4);
        let producer = tokio::spawn(async move {
            for i in 0..20 {
                sink.emit(StreamEvent::TextDelta {
                    delta: i.to_string(),
                })
                .await;
            }
        });
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::TextDelta { delta } = event {
                seen.push(delta);
            }
        }
        producer.await.expect("producer");
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn emit_reports_a_dropped_consumer() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        assert!(
            !sink
                .emit(StreamEvent::Error {
                    message: "x".to_string()
                })
                .await
        );
    }
}
