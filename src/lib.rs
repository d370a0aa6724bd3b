pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod connection_manager;
pub mod error;
pub mod filter;
pub mod history;
pub mod metrics;
pub mod outbound_queue;
pub mod rate_limit;
pub mod replay;
pub mod session;
pub mod state;
pub mod subscription;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;

/// Builds the router exposing the fabric's whole external surface (§6.6):
/// the single multiplexed WebSocket channel plus the handful of HTTP routes
/// that don't belong on it (liveness/readiness probes, a REST snapshot of
/// `connection_stats` for dashboards that aren't WS-connected).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/events", get(ws::events_ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/v1/connection-stats", get(http::connection_stats))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}

mod http {
    use crate::state::AppState;
    use axum::extract::State;
    use axum::Json;

    pub async fn connection_stats(State(state): State<AppState>) -> Json<fabric_protocol::ConnectionStatsBody> {
        Json(state.connection_stats().await)
    }
}
