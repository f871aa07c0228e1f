use crate::server::AppState;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/webhook", post(post_webhook))
}

/// Always answers 200 with a status label unless coordination itself failed,
/// so the provider does not redeliver ignored events.
#[tracing::instrument(level = "debug", skip_all, fields(body_len = body.len()))]
async fn post_webhook(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.gateway.handle(&body).await {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::to_value(status).unwrap_or_else(|e| {
                serde_json::json!({ "status": "error", "message": e.to_string() })
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "webhook handling failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "message": e.to_string() })),
            )
        }
    }
}
