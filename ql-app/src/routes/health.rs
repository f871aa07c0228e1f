use crate::server::AppState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(
    Extension(state): Extension<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let store = state.coordinator.store();
    let ping = store.ping().await;
    let stats = state.queue.stats();
    let status = if ping.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if let Err(e) = &ping {
        tracing::error!(error = %e, "health check store ping failed");
    }

    (
        status,
        Json(serde_json::json!({
            "status": if ping.is_ok() { "ok" } else { "error" },
            "checked_at": Utc::now(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "checks": {
                "store": {
                    "backend": store.backend(),
                    "reachable": ping.is_ok(),
                    "error": ping.as_ref().err().map(|e| e.to_string()),
                },
                "queue": {
                    "scheduled": stats.scheduled,
                    "running": stats.running,
                    "finished": stats.finished,
                },
                "namespace": state.coordinator.keys().namespace(),
            }
        })),
    )
}
