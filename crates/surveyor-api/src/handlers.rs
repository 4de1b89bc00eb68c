//! Request handlers.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use surveyor_metrics::{CONTENT_TYPE, render_prometheus};

use crate::ApiState;

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    match state.collector.scrape().await {
        Ok(samples) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE)],
            render_prometheus(&samples),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "scrape failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}
