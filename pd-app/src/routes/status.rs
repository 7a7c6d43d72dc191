use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/status", get(get_status))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.pipeline.status();
    Json(serde_json::json!({
        "ok": true,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "sessions": status.sessions,
        "live_handles": status.live_handles,
        "executor": status.executor,
        "resources": status.resources,
    }))
}
