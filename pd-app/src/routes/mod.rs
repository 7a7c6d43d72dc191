pub mod health;
pub mod sessions;
pub mod status;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(status::router())
        .merge(sessions::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PdfdeskConfig;
    use crate::server::{AppState, build_pipeline};
    use axum::Extension;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Instant;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_and_status_report_live_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = PdfdeskConfig::default();
        cfg.storage.temp_dir = Some(dir.path().display().to_string());
        let (pipeline, _rx) = build_pipeline(&cfg).unwrap();
        let app = router().layer(Extension(Arc::new(AppState {
            pipeline,
            started_at: Instant::now(),
        })));

        let health = get_json(app.clone(), "/healthz").await;
        assert_eq!(health, serde_json::json!({ "ok": true }));

        let status = get_json(app.clone(), "/api/v1/status").await;
        assert_eq!(status["sessions"], 0);
        assert_eq!(status["live_handles"], 0);
        assert_eq!(status["executor"]["limit"], 6);

        let sessions = get_json(app, "/api/v1/sessions").await;
        assert_eq!(sessions["sessions"], serde_json::json!([]));
    }
}
