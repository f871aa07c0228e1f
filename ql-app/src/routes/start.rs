use axum::routing::get;

pub fn router() -> axum::Router {
    axum::Router::new().route("/start", get(get_start))
}

async fn get_start() -> &'static str {
    "quietline is running"
}
