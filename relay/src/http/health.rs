//! Health check endpoint.

use crate::server::WebRelay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok`, or `degraded` when the message store cannot be queried.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Live WebSocket connections across both auth flows.
    pub connections: usize,
    /// Subscriptions with at least one live connection.
    pub subscriptions: usize,
    /// Peers with a live identity-proof connection.
    pub peers: usize,
    /// Running fan-out loops.
    pub fanout_loops: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<WebRelay>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    let status = match relay.store().message_count().await {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!("Health check could not query the store: {}", e);
            "degraded"
        }
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: relay.total_connections(),
        subscriptions: relay.topics().key_count(),
        peers: relay.peers().key_count(),
        fanout_loops: relay.fanout_count().await,
        uptime_seconds: uptime,
    })
}
