// HTTP route handlers for the k6 webhook server

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use crate::single_request::error_response;
use crate::AppState;

/// POST /launch-test - Launch a k6 load test for a Flagger webhook
///
/// The launch runs in its own task so that a disconnecting caller only
/// cancels the request scope; the bookkeeping for the run still completes.
pub async fn launch_test(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();
    let ip = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let span = info_span!("launch", request_id = %request_id, command = %uri, ip = %ip);

    let request_scope = CancellationToken::new();
    let _request_guard = request_scope.clone().drop_guard();

    let launcher = state.launcher.clone();
    let task = tokio::spawn(
        async move { launcher.handle(&body, request_scope).await }.instrument(span),
    );

    let response = match task.await {
        Ok(response) => response,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Launch task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    };

    state
        .launcher
        .metrics()
        .record_request(response.status().as_u16());
    response
}

/// GET /health - Liveness check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "Good to go!")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.launcher.encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
