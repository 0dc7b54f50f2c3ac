//! Per-topic fan-out loop.
//!
//! Persists every payload published to a subscribed topic, then pushes it
//! to each live connection registered under the subscription.

use crate::network::TopicStream;
use crate::report::ReportKind;
use crate::server::{RelayMetrics, WebRelay};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use relay_types::{EncryptedMessage, MessageId, ServerFrame, SubscriptionKey};
use std::sync::Arc;

/// Drain `stream` until the network ends the subscription.
pub(crate) async fn run(
    relay: Arc<WebRelay>,
    key: SubscriptionKey,
    mut stream: TopicStream,
    generation: u64,
) {
    tracing::debug!("Fan-out loop {} started for {}", generation, key);

    while let Some(payload) = stream.recv().await {
        handle_payload(&relay, &key, &payload).await;
    }

    relay.fanout_finished(&key, generation).await;
    relay.reporter().report(
        ReportKind::Network,
        None,
        format!("subscription stream for {} ended", key),
    );
    tracing::info!("Fan-out loop for {} stopped", key);
}

/// Persist one payload and push it to the live connections for `key`.
pub(crate) async fn handle_payload(relay: &WebRelay, key: &SubscriptionKey, payload: &[u8]) {
    let id = MessageId::for_payload(payload);

    let store = relay.store().clone();
    let stored = relay
        .with_retry("put_message", || {
            let store = store.clone();
            let (key, id) = (key.clone(), id.clone());
            let payload = payload.to_vec();
            async move { store.put_message(&key, &id, &payload).await }
        })
        .await;
    match stored {
        Ok(()) => RelayMetrics::incr(&relay.metrics().messages_stored),
        Err(e) => relay.reporter().report(
            ReportKind::Storage,
            None,
            format!("failed to store {} for {}: {}", id, key, e),
        ),
    }

    let connections = relay.topics().snapshot(key);
    if connections.is_empty() {
        return;
    }

    let frame = ServerFrame::Message(EncryptedMessage {
        id: id.to_string(),
        message: STANDARD.encode(payload),
        recipient: String::new(),
    });
    let text = match frame.to_json() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to serialize message frame: {}", e);
            return;
        }
    };

    for connection in &connections {
        match connection.deliver(&id, text.clone()) {
            Ok(()) => RelayMetrics::incr(&relay.metrics().live_delivered),
            Err(e) => {
                RelayMetrics::incr(&relay.metrics().delivery_errors);
                relay.reporter().report(
                    ReportKind::Delivery,
                    Some(connection.id()),
                    format!("live delivery of {} failed: {}", id, e),
                );
            }
        }
    }

    tracing::debug!("Fanned out {} to {} connections", id, connections.len());
}
