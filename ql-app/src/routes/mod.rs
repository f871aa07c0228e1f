pub mod health;
pub mod history;
pub mod start;
pub mod webhook;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(webhook::router())
        .merge(health::router())
        .merge(history::router())
        .merge(start::router())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::gateway::testing::Fixture;
    use crate::server::AppState;
    use axum::body::to_bytes;
    use std::sync::Arc;
    use std::time::Instant;

    pub(crate) fn state(f: &Fixture) -> Arc<AppState> {
        Arc::new(AppState {
            gateway: f.gateway.clone(),
            coordinator: f.coordinator.clone(),
            queue: f.queue.clone(),
            threads: f.threads.clone(),
            assistant: f.assistant.clone(),
            started_at: Instant::now(),
        })
    }

    pub(crate) fn app(f: &Fixture) -> axum::Router {
        super::router().layer(axum::Extension(state(f)))
    }

    pub(crate) async fn response_body_json(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }
}
