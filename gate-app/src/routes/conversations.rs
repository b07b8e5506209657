use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use gate_llm::ConversationId;
use std::sync::Arc;

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/conversations", get(list_conversations))
        .route(
            "/api/v1/conversations/{id}",
            get(get_conversation).delete(delete_conversation),
        )
}

fn storage_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!(error = %e, "message store request failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "conversation storage is unavailable" })),
    )
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_conversations(Extension(state): Extension<Arc<AppState>>) -> ApiResult {
    let conversations = state.engine.store().list().await.map_err(storage_error)?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

#[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %id))]
async fn get_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = ConversationId::from(id);
    let messages = state.engine.store().load(&id).await.map_err(storage_error)?;
    if messages.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "conversation not found" })),
        ));
    }
    Ok(Json(serde_json::json!({
        "conversationId": id,
        "messages": messages,
    })))
}

#[tracing::instrument(level = "info", skip_all, fields(conversation_id = %id))]
async fn delete_conversation(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = ConversationId::from(id);
    let deleted = state
        .engine
        .delete_conversation(&id)
        .await
        .map_err(storage_error)?;
    Ok(Json(serde_json::json!({
        "status": if deleted { "ok" } else { "not_found" },
    })))
}
