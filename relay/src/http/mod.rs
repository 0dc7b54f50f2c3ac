//! HTTP surface for webrelay.
//!
//! Serves the WebSocket endpoint at `/` plus health and metrics endpoints.

pub mod health;
mod metrics;
mod ws;

use crate::server::WebRelay;
use axum::{routing::get, Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<WebRelay>) -> Router {
    let mut router = Router::new().route("/", get(ws::ws_handler));
    if relay.config().http.metrics_enabled {
        router = router
            .route("/health", get(health::health_handler))
            .route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(relay))
}

/// Serve the router on `listener` until the process stops.
///
/// Peer addresses are made available to handlers for per-IP rate limiting.
pub async fn serve(relay: Arc<WebRelay>, listener: TcpListener) -> std::io::Result<()> {
    let app = build_router(relay).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await
}
