use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json};
use rf_batch::{BatchStats, SenderKey};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/batches", get(list_batches))
        .route("/api/v1/batches/{sender}", delete(discard_batch))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_batches(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    match BatchStats::collect(&state.batches, &state.poller.policy()).await {
        Ok(stats) => (StatusCode::OK, Json(serde_json::json!(stats))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn discard_batch(
    Extension(state): Extension<Arc<AppState>>,
    Path(sender): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    let sender = match SenderKey::normalize(&sender) {
        Ok(sender) => sender,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            );
        }
    };
    match state.batches.discard(&sender).await {
        Ok(()) => {
            tracing::info!(sender = %sender, "batch discarded by operator");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "status": "ok", "sender": sender })),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}
