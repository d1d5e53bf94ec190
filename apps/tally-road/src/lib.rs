//! Rendezvous server for tally peers: groups websocket clients into rooms by
//! session id and relays negotiation frames between them. Application data
//! never passes through here.

pub mod config;
pub mod signaling;
pub mod websocket;

use axum::{
    extract::{FromRef, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use websocket::RoadState;

#[derive(Clone)]
pub struct AppState {
    pub road: RoadState,
    /// Present when the binary installed a Prometheus recorder.
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for RoadState {
    fn from_ref(state: &AppState) -> Self {
        state.road.clone()
    }
}

pub fn build_router(road: RoadState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/signal", get(websocket::websocket_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { road, metrics })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
