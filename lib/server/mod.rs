pub mod monitoring;

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

async fn health_handler() -> String {
    "Healthy".to_string()
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> String {
    let mut body = String::new();
    let _ = encode(&mut body, &registry);
    body
}

pub fn build_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}
