//! Per-connection session for the subscription-key flow.
//!
//! Each WebSocket gets a Session that authenticates the client, replays
//! unread messages for its subscription, then serves relay and ack frames
//! until the client goes away.

use crate::error::{ProtocolError, ProtocolResult};
use crate::registry::ConnectionHandle;
use crate::report::ReportKind;
use crate::server::{RelayMetrics, WebRelay};
use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_types::{
    decode_data, envelope_data, split_envelope, EncryptedMessage, InboundMessage, MessageId,
    PeerId, ServerFrame, SubscribeRequest, SubscriptionKey,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

/// How long replay and release wait for room in a full outbound queue.
pub(crate) const QUEUE_WAIT: Duration = Duration::from_secs(10);

/// Session state machine states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the `{userID, subscriptionKey}` frame.
    AwaitingAuth,
    /// Subscription stored and connection registered.
    Registered {
        /// Reader identity.
        user_id: String,
        /// The subscription being served.
        key: SubscriptionKey,
    },
    /// Replay done; relaying frames.
    Serving {
        /// Reader identity.
        user_id: String,
        /// The subscription being served.
        key: SubscriptionKey,
    },
    /// Connection finished.
    Closed,
}

impl SessionState {
    /// Whether `next` may follow this state.
    pub fn can_advance_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::AwaitingAuth, Self::Registered { .. })
                | (Self::Registered { .. }, Self::Serving { .. })
                | (_, Self::Closed)
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Self::AwaitingAuth => "awaiting_auth",
            Self::Registered { .. } => "registered",
            Self::Serving { .. } => "serving",
            Self::Closed => "closed",
        }
    }
}

/// A frame read from the client.
#[derive(Debug)]
pub(crate) enum ClientFrame {
    /// A UTF-8 text frame.
    Text(String),
    /// A binary frame of the given length.
    Binary(usize),
}

/// Split WebSocket with a writer task draining an outbound queue.
pub(crate) struct WsConnection {
    reader: SplitStream<WebSocket>,
    outbound: Sender<String>,
    writer: JoinHandle<()>,
}

impl WsConnection {
    /// Split `socket`, with room for `queue_size` unwritten frames.
    pub(crate) fn new(socket: WebSocket, queue_size: usize) -> Self {
        let (sink, reader) = socket.split();
        let (outbound, rx) = mpsc::channel(queue_size.max(1));
        let writer = tokio::spawn(write_loop(sink, rx));
        Self {
            reader,
            outbound,
            writer,
        }
    }

    /// Sender for the outbound queue.
    pub(crate) fn outbound(&self) -> Sender<String> {
        self.outbound.clone()
    }

    /// Queue a frame without waiting.
    pub(crate) fn send(&self, frame: &ServerFrame) -> ProtocolResult<()> {
        self.outbound.try_send(encode(frame)?).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ProtocolError::Closed,
        })
    }

    /// Read the next text or binary frame. Pings and pongs are skipped.
    pub(crate) async fn next_frame(&mut self) -> ProtocolResult<ClientFrame> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ClientFrame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => return Ok(ClientFrame::Binary(bytes.len())),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::Closed),
                Some(Err(e)) => return Err(ProtocolError::Connection(e.to_string())),
            }
        }
    }

    /// [`WsConnection::next_frame`] with a deadline.
    pub(crate) async fn next_frame_within(&mut self, secs: u64) -> ProtocolResult<ClientFrame> {
        tokio::time::timeout(Duration::from_secs(secs), self.next_frame())
            .await
            .map_err(|_| ProtocolError::AuthTimeout { secs })?
    }

    /// Flush queued frames, then close the socket.
    pub(crate) async fn close(self) {
        let Self {
            reader,
            outbound,
            writer,
        } = self;
        drop(outbound);
        drop(reader);
        // Handles cloned into fan-out snapshots may keep the queue open briefly.
        if tokio::time::timeout(Duration::from_secs(5), writer).await.is_err() {
            tracing::debug!("Writer did not drain in time");
        }
    }

    /// Send an `{"error": ...}` frame and close.
    pub(crate) async fn reject(self, reason: &str) -> ProtocolError {
        if let Err(e) = self.send(&ServerFrame::error(reason)) {
            tracing::debug!("Could not send error frame: {}", e);
        }
        self.close().await;
        ProtocolError::InvalidMessage {
            reason: reason.to_string(),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: Receiver<String>,
) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::debug!("WebSocket write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

/// Serialize a frame for the wire.
pub(crate) fn encode(frame: &ServerFrame) -> ProtocolResult<String> {
    frame.to_json().map_err(|e| ProtocolError::InvalidMessage {
        reason: e.to_string(),
    })
}

/// Validate the first frame of the subscription-key flow.
///
/// The error is the reason sent to the client.
pub fn parse_subscribe(text: &str) -> Result<(String, SubscriptionKey), &'static str> {
    let data = envelope_data(text).map_err(|_| "invalid incoming message")?;
    let request: SubscribeRequest = decode_data(&data).map_err(|_| "invalid auth message")?;
    if request.user_id.is_empty() {
        return Err("userID required");
    }
    let key = SubscriptionKey::parse(&request.subscription_key)
        .map_err(|_| "invalid subscription key")?;
    Ok((request.user_id, key))
}

/// A per-connection session.
pub struct Session {
    relay: Arc<WebRelay>,
    conn: WsConnection,
    state: SessionState,
}

impl Session {
    /// Create a new session for an upgraded socket.
    pub fn new(relay: Arc<WebRelay>, socket: WebSocket) -> Self {
        let queue_size = relay.config().server.outbound_queue_size;
        Self {
            relay,
            conn: WsConnection::new(socket, queue_size),
            state: SessionState::AwaitingAuth,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!("Session {} -> {}", self.state.name(), next.name());
        self.state = next;
    }

    /// Run the session until completion.
    pub async fn run(mut self) -> ProtocolResult<()> {
        let relay = self.relay.clone();
        let timeout_secs = relay.config().server.auth_timeout_secs;

        // AwaitingAuth
        let text = match self.conn.next_frame_within(timeout_secs).await {
            Ok(ClientFrame::Text(text)) => text,
            Ok(ClientFrame::Binary(_)) => {
                RelayMetrics::incr(&relay.metrics().auth_failures);
                return Err(self.conn.reject("invalid incoming message").await);
            }
            Err(e) => {
                if matches!(e, ProtocolError::AuthTimeout { .. }) {
                    tracing::warn!("Auth timeout ({}s), closing connection", timeout_secs);
                    RelayMetrics::incr(&relay.metrics().auth_failures);
                }
                self.conn.close().await;
                return Err(e);
            }
        };

        let (user_id, key) = match parse_subscribe(&text) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::debug!("Rejecting auth frame: {}", reason);
                RelayMetrics::incr(&relay.metrics().auth_failures);
                return Err(self.conn.reject(reason).await);
            }
        };

        // Registered
        let store = relay.store().clone();
        let added = relay
            .with_retry("add_subscription", || {
                let store = store.clone();
                let key = key.clone();
                async move { store.add_subscription(&key).await }
            })
            .await;
        if let Err(e) = added {
            tracing::error!("Failed to store subscription {}: {}", key, e);
            return Err(self.conn.reject("database error").await);
        }

        if let Err(e) = relay.ensure_subscribed(&key).await {
            tracing::error!("Failed to subscribe to {}: {}", key.topic(), e);
            return Err(self.conn.reject("subscribe error").await);
        }

        let handle = ConnectionHandle::held(self.conn.outbound());
        let connection_id = handle.id();
        let registration = relay.topics().register(key.clone(), handle.clone());
        self.advance(SessionState::Registered {
            user_id: user_id.clone(),
            key: key.clone(),
        });
        tracing::info!(
            "Connection {} authenticated: user={} subscription={}",
            connection_id,
            user_id,
            key
        );

        // Serving
        handle.send(encode(&ServerFrame::Auth { auth: true })?)?;
        RelayMetrics::incr(&relay.metrics().auth_successes);

        let replayed = self.replay(&handle, &user_id, &key).await;
        match handle.release(&replayed, QUEUE_WAIT).await {
            Ok(flushed) => tracing::debug!(
                "Connection {} replayed {} messages, flushed {} live",
                connection_id,
                replayed.len(),
                flushed
            ),
            Err(e) => {
                RelayMetrics::incr(&relay.metrics().delivery_errors);
                relay.reporter().report(
                    ReportKind::Delivery,
                    Some(connection_id),
                    format!("flushing held messages failed: {e}"),
                );
            }
        }
        self.advance(SessionState::Serving {
            user_id: user_id.clone(),
            key: key.clone(),
        });

        loop {
            match self.conn.next_frame().await {
                Ok(ClientFrame::Text(text)) => {
                    self.handle_frame(connection_id, &user_id, &text).await;
                }
                Ok(ClientFrame::Binary(len)) => relay.reporter().report(
                    ReportKind::DecodeAmbiguity,
                    Some(connection_id),
                    format!("ignoring {len}-byte binary frame"),
                ),
                Err(ProtocolError::Closed) => {
                    tracing::debug!("Connection {} closed by client", connection_id);
                    break;
                }
                Err(e) => {
                    tracing::debug!("Connection {} read error: {}", connection_id, e);
                    break;
                }
            }
        }

        // Closed
        drop(registration);
        drop(handle);
        self.advance(SessionState::Closed);
        self.conn.close().await;
        tracing::info!("Connection {} finished", connection_id);
        Ok(())
    }

    /// Queue every unread stored message; returns the ids sent.
    async fn replay(
        &self,
        handle: &ConnectionHandle,
        user_id: &str,
        key: &SubscriptionKey,
    ) -> HashSet<MessageId> {
        let mut sent = HashSet::new();
        let store = self.relay.store().clone();
        let messages = self
            .relay
            .with_retry("get_messages", || {
                let store = store.clone();
                let (user_id, key) = (user_id.to_string(), key.clone());
                async move { store.get_messages(&user_id, &key).await }
            })
            .await;

        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                self.relay.reporter().report(
                    ReportKind::Storage,
                    Some(handle.id()),
                    format!("replay read for {} failed: {}", key, e),
                );
                return sent;
            }
        };

        for message in messages {
            let frame = ServerFrame::Message(EncryptedMessage {
                id: message.id.to_string(),
                message: STANDARD.encode(&message.payload),
                recipient: String::new(),
            });
            let queued = match encode(&frame) {
                Ok(text) => handle.send_wait(text, QUEUE_WAIT).await,
                Err(e) => Err(e),
            };
            if let Err(e) = queued {
                if matches!(e, ProtocolError::QueueFull) {
                    RelayMetrics::incr(&self.relay.metrics().delivery_errors);
                    self.relay.reporter().report(
                        ReportKind::Delivery,
                        Some(handle.id()),
                        format!("replay of {} stopped: {}", message.id, e),
                    );
                }
                tracing::debug!("Replay to connection {} stopped: {}", handle.id(), e);
                break;
            }
            RelayMetrics::incr(&self.relay.metrics().replayed);
            sent.insert(message.id);
        }
        sent
    }

    /// Handle one frame received while serving. Never ends the session.
    ///
    /// Acks are exempt from the frame limit so a client can always mark
    /// replayed messages read.
    async fn handle_frame(&self, connection_id: u64, user_id: &str, text: &str) {
        let relay = &self.relay;

        let decoded = match split_envelope(text) {
            Ok((message_type, data)) => match InboundMessage::decode(&data) {
                Ok(message) => Ok((message_type, message)),
                Err(_) => Err((
                    ReportKind::DecodeAmbiguity,
                    format!("unknown message type {:?}", message_type.unwrap_or_default()),
                )),
            },
            Err(e) => Err((ReportKind::Decode, format!("invalid incoming message: {e}"))),
        };

        if !matches!(decoded, Ok((_, InboundMessage::Ack(_)))) {
            if let Err(e) = relay.rate_limits().check_frame(connection_id) {
                RelayMetrics::incr(&relay.metrics().rate_limit_hits);
                relay
                    .reporter()
                    .report(ReportKind::RateLimited, Some(connection_id), e.to_string());
                return;
            }
        }

        let (message_type, message) = match decoded {
            Ok(decoded) => decoded,
            Err((kind, detail)) => {
                relay.reporter().report(kind, Some(connection_id), detail);
                return;
            }
        };

        if let Some(declared) = message_type.as_deref() {
            if !declared.is_empty() && declared != message.type_name() {
                tracing::debug!(
                    "Envelope type {} decoded as {}",
                    declared,
                    message.type_name()
                );
            }
        }

        match message {
            InboundMessage::Encrypted(message) => self.relay_outbound(connection_id, message).await,
            InboundMessage::Ack(ack) => self.acknowledge(connection_id, user_id, &ack.message_id).await,
        }
    }

    /// Hand a client message to the network for its recipient.
    async fn relay_outbound(&self, connection_id: u64, message: EncryptedMessage) {
        let relay = &self.relay;

        let payload = match STANDARD.decode(message.message.as_bytes()) {
            Ok(payload) => payload,
            Err(e) => {
                relay.reporter().report(
                    ReportKind::Decode,
                    Some(connection_id),
                    format!("invalid message encoding: {e}"),
                );
                return;
            }
        };

        let Ok(recipient) = PeerId::parse(&message.recipient) else {
            tracing::debug!(
                "Dropping message with invalid recipient {:?} from connection {}",
                message.recipient,
                connection_id
            );
            return;
        };

        match relay.network().send_direct(&recipient, &payload).await {
            Ok(()) => {
                RelayMetrics::incr(&relay.metrics().outbound_relayed);
                tracing::debug!("Relayed {} bytes to {}", payload.len(), recipient);
            }
            Err(e) => {
                RelayMetrics::incr(&relay.metrics().delivery_errors);
                relay.reporter().report(
                    ReportKind::Delivery,
                    Some(connection_id),
                    format!("send to {} failed: {}", recipient, e),
                );
            }
        }
    }

    /// Record a read acknowledgement.
    async fn acknowledge(&self, connection_id: u64, user_id: &str, message_id: &str) {
        let relay = &self.relay;

        let id = match MessageId::parse(message_id) {
            Ok(id) => id,
            Err(e) => {
                relay
                    .reporter()
                    .report(ReportKind::Decode, Some(connection_id), e.to_string());
                return;
            }
        };

        let store = relay.store().clone();
        let result = relay
            .with_retry("mark_read", || {
                let store = store.clone();
                let (id, user_id) = (id.clone(), user_id.to_string());
                async move { store.mark_read(&id, &user_id).await }
            })
            .await;

        match result {
            Ok(()) => RelayMetrics::incr(&relay.metrics().acks),
            Err(e) => relay.reporter().report(
                ReportKind::Storage,
                Some(connection_id),
                format!("ack of {} failed: {}", id, e),
            ),
        }
    }
}
