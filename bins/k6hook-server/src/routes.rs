// Route table for the k6 webhook server

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/launch-test", post(handlers::launch_test))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}
