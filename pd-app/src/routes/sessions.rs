use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/sessions", get(list_sessions))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let sessions = state.pipeline.sessions().list();
    Json(serde_json::json!({ "sessions": sessions }))
}
