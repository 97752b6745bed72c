use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let store_error = state
        .batches
        .backend()
        .ping()
        .await
        .err()
        .map(|e| e.to_string());
    let poller = state.poller.status_snapshot().await;
    let ready = store_error.is_none() && poller.active;

    Json(serde_json::json!({
        "status": if ready { "ok" } else { "degraded" },
        "ready": ready,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "checks": {
            "store": {
                "backend": state.batches.backend().backend(),
                "ok": store_error.is_none(),
                "error": store_error,
            },
            "poller": poller,
        }
    }))
}
