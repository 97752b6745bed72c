use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use rf_batch::BatchError;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnqueueRequest {
    sender: String,
    text: String,
    #[serde(default)]
    routing_context: serde_json::Value,
    #[serde(default)]
    metadata: serde_json::Value,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/messages", post(enqueue_message))
}

#[tracing::instrument(level = "info", skip_all)]
async fn enqueue_message(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "error": "text is empty" })),
        );
    }
    match state
        .batches
        .enqueue(&req.sender, &req.text, req.routing_context, req.metadata)
        .await
    {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "queued",
                "sender": receipt.sender,
                "batch_size": receipt.batch_size,
            })),
        ),
        Err(e) => {
            let status = match &e {
                BatchError::InvalidSender(_) => StatusCode::BAD_REQUEST,
                _ if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(error = %e, "enqueue failed");
            (
                status,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}
