use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/tools", get(list_tools))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_tools(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "tools": state.engine.registry().summaries() }))
}
