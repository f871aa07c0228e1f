use crate::server::AppState;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/history", get(get_history))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    userid: Option<String>,
}

/// Conversation transcript for operators, oldest first.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_history(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(user) = query.userid.filter(|u| !u.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "status": "error", "message": "userid is required" })),
        );
    };

    let thread_id = match state.threads.get(&user).await {
        Ok(thread_id) => thread_id,
        Err(e) => return internal_error(&user, e),
    };
    let Some(thread_id) = thread_id else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "user": user, "thread_id": null, "messages": [] })),
        );
    };
    match state.assistant.transcript(&thread_id).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "user": user,
                "thread_id": thread_id,
                "open": state.threads.is_open(&user).await,
                "messages": messages,
            })),
        ),
        Err(e) => internal_error(&user, e),
    }
}

fn internal_error(user: &str, e: anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!(user, error = %e, "history lookup failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "status": "error", "message": e.to_string() })),
    )
}
