//! Prometheus metrics endpoint.

use crate::server::WebRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
pub async fn metrics_handler(Extension(relay): Extension<Arc<WebRelay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&relay).await,
    )
}

async fn render(relay: &WebRelay) -> String {
    let m = relay.metrics();

    // Gauges
    let connections = relay.total_connections();
    let subscriptions = relay.topics().key_count();
    let peers = relay.peers().key_count();
    let fanout_loops = relay.fanout_count().await;

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let auth_ok = m.auth_successes.load(Ordering::Relaxed);
    let auth_failed = m.auth_failures.load(Ordering::Relaxed);
    let stored = m.messages_stored.load(Ordering::Relaxed);
    let live = m.live_delivered.load(Ordering::Relaxed);
    let replayed = m.replayed.load(Ordering::Relaxed);
    let outbound = m.outbound_relayed.load(Ordering::Relaxed);
    let acks = m.acks.load(Ordering::Relaxed);
    let delivery_errors = m.delivery_errors.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);

    // Store totals (best effort)
    let store_messages = relay.store().message_count().await.unwrap_or(0);
    let store_subscriptions = relay.store().subscription_count().await.unwrap_or(0);

    format!(
        r#"# HELP webrelay_connections_active Number of live WebSocket connections
# TYPE webrelay_connections_active gauge
webrelay_connections_active {connections}

# HELP webrelay_subscriptions_active Subscriptions with a live connection
# TYPE webrelay_subscriptions_active gauge
webrelay_subscriptions_active {subscriptions}

# HELP webrelay_peers_active Peers with a live identity connection
# TYPE webrelay_peers_active gauge
webrelay_peers_active {peers}

# HELP webrelay_fanout_loops Running per-topic fan-out loops
# TYPE webrelay_fanout_loops gauge
webrelay_fanout_loops {fanout_loops}

# HELP webrelay_info Server information
# TYPE webrelay_info gauge
webrelay_info{{version="{version}"}} 1

# HELP webrelay_connections_total Total connections accepted
# TYPE webrelay_connections_total counter
webrelay_connections_total {conns_total}

# HELP webrelay_auth_successes_total Connections that authenticated
# TYPE webrelay_auth_successes_total counter
webrelay_auth_successes_total {auth_ok}

# HELP webrelay_auth_failures_total Connections rejected during authentication
# TYPE webrelay_auth_failures_total counter
webrelay_auth_failures_total {auth_failed}

# HELP webrelay_messages_stored_total Payloads persisted from the network
# TYPE webrelay_messages_stored_total counter
webrelay_messages_stored_total {stored}

# HELP webrelay_live_delivered_total Live frames queued to connections
# TYPE webrelay_live_delivered_total counter
webrelay_live_delivered_total {live}

# HELP webrelay_replayed_total Stored frames replayed after authentication
# TYPE webrelay_replayed_total counter
webrelay_replayed_total {replayed}

# HELP webrelay_outbound_relayed_total Client messages handed to the network
# TYPE webrelay_outbound_relayed_total counter
webrelay_outbound_relayed_total {outbound}

# HELP webrelay_acks_total Read acknowledgements recorded
# TYPE webrelay_acks_total counter
webrelay_acks_total {acks}

# HELP webrelay_delivery_errors_total Failed pushes to connections or peers
# TYPE webrelay_delivery_errors_total counter
webrelay_delivery_errors_total {delivery_errors}

# HELP webrelay_rate_limit_hits_total Total rate limit rejections
# TYPE webrelay_rate_limit_hits_total counter
webrelay_rate_limit_hits_total {rate_limits}

# HELP webrelay_store_messages Messages currently in the store
# TYPE webrelay_store_messages gauge
webrelay_store_messages {store_messages}

# HELP webrelay_store_subscriptions Subscriptions recorded in the store
# TYPE webrelay_store_subscriptions gauge
webrelay_store_subscriptions {store_subscriptions}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
