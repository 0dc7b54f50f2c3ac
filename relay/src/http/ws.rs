//! WebSocket upgrade endpoint.

use crate::config::AuthMode;
use crate::identity::IdentitySession;
use crate::report::ReportKind;
use crate::server::{RelayMetrics, WebRelay};
use crate::session::Session;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::ConnectInfo;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use std::net::SocketAddr;
use std::sync::Arc;

/// Upgrade handler for `/`.
///
/// Applies the per-IP connection limit before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(relay): Extension<Arc<WebRelay>>,
) -> Response {
    if let Err(e) = relay.rate_limits().check_connection(addr.ip()) {
        RelayMetrics::incr(&relay.metrics().rate_limit_hits);
        relay
            .reporter()
            .report(ReportKind::RateLimited, None, format!("{} from {}", e, addr));
        return (StatusCode::TOO_MANY_REQUESTS, e.to_string()).into_response();
    }

    RelayMetrics::incr(&relay.metrics().connections_total);
    let max_frame_size = relay.config().server.max_frame_size;

    ws.max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| serve_socket(relay, socket, addr))
}

async fn serve_socket(relay: Arc<WebRelay>, socket: WebSocket, addr: SocketAddr) {
    tracing::debug!("WebSocket connection from {}", addr);

    let result = match relay.config().auth.mode {
        AuthMode::Subscription => Session::new(relay.clone(), socket).run().await,
        AuthMode::Identity => IdentitySession::new(relay.clone(), socket).run().await,
    };

    match result {
        Ok(()) => tracing::debug!("Connection from {} closed", addr),
        Err(e) => tracing::debug!("Connection from {} ended: {}", addr, e),
    }
}
