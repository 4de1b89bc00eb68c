//! surveyor-api: HTTP surface of the surveyor.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/metrics` | Prometheus exposition, behind basic auth when configured |
//! | GET | `/healthz` | Liveness of the surveyor process itself |

pub mod auth;
pub mod handlers;
pub mod server;
pub mod tls;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use surveyor_metrics::SurveyCollector;

pub use auth::BasicAuth;
pub use server::{Surveyor, SurveyorError, SurveyorResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub collector: SurveyCollector,
}

/// Build the router. With `auth` set, `/metrics` requires those
/// credentials; `/healthz` is always open.
pub fn build_router(collector: SurveyCollector, auth: Option<BasicAuth>) -> Router {
    let mut metrics = Router::new()
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(ApiState { collector });

    if let Some(auth) = auth {
        metrics = metrics.route_layer(middleware::from_fn_with_state(
            Arc::new(auth),
            auth::require_basic_auth,
        ));
    }

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(metrics)
}
