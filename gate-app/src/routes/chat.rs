use crate::approval::{Decision, Decisions};
use crate::error::TurnError;
use crate::server::AppState;
use crate::turn::{TurnRequest, UserInput};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Extension, Json};
use futures_util::Stream;
use gate_llm::{ConversationId, MessageId, ToolCallId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChatBody {
    conversation_id: String,
    #[serde(default)]
    message: Option<ChatMessage>,
    /// toolCallId -> `APPROVAL.YES` | `APPROVAL.NO` | `YES` | `NO`
    #[serde(default)]
    decisions: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatMessage {
    #[serde(default)]
    id: Option<String>,
    text: String,
}

impl ChatBody {
    fn into_turn_request(self) -> Result<TurnRequest, TurnError> {
        let mut decisions = Decisions::new();
        for (tool_call_id, raw) in self.decisions {
            let decision = Decision::parse(&raw).ok_or_else(|| {
                TurnError::InvalidRequest(format!(
                    "decision for {tool_call_id} must be APPROVAL.YES or APPROVAL.NO, got {raw:?}"
                ))
            })?;
            decisions.insert(ToolCallId::from(tool_call_id), decision);
        }
        let request = TurnRequest {
            conversation_id: ConversationId::from(self.conversation_id),
            message: self.message.map(|m| UserInput {
                id: m.id.filter(|id| !id.trim().is_empty()).map(MessageId::from),
                text: m.text,
            }),
            decisions,
        };
        request.validate()?;
        Ok(request)
    }
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/chat", post(post_chat))
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %body.conversation_id))]
async fn post_chat(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<
    Sse<impl Stream<Item = Result<Event, axum::Error>>>,
    (StatusCode, Json<serde_json::Value>),
> {
    let request = body.into_turn_request().map_err(|e| {
        tracing::warn!(error = %e, "chat request rejected");
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.public_message() })),
        )
    })?;

    let cancel = state.shutdown.child_token();
    let rx = state.engine.start(request, cancel.clone());
    // The guard lives as long as the response body; a disconnect cancels the turn.
    let events = futures_util::stream::unfold(
        (rx, cancel.drop_guard()),
        |(mut rx, guard)| async move {
            let event = rx.recv().await?;
            Some((event.to_sse(), (rx, guard)))
        },
    );
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
