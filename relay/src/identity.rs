//! Identity-proof authentication.
//!
//! The client claims a peer id and presents its Ed25519 public key. The relay
//! encrypts a random nonce to that key; only the key holder can decrypt it
//! and echo it back. Authenticated connections are registered under their
//! [`PeerId`] and currently serve an echo loop.

use crate::crypto::encrypt_challenge;
use crate::error::{ProtocolError, ProtocolResult};
use crate::registry::ConnectionHandle;
use crate::report::ReportKind;
use crate::server::{RelayMetrics, WebRelay};
use crate::session::{encode, ClientFrame, WsConnection};
use axum::extract::ws::WebSocket;
use relay_types::{
    decode_data, envelope_data, ChallengeResponse, IdentityAuthRequest, PeerId, ServerFrame,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Size of the challenge nonce in bytes.
pub const CHALLENGE_NONCE_SIZE: usize = 32;

/// Identity session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// Waiting for `{peerID, pubkey}`.
    AwaitingAuthRequest,
    /// Challenge written to the client.
    ChallengeSent,
    /// Waiting for `{nonce}`.
    AwaitingChallengeResponse,
    /// Proof accepted and connection registered.
    Registered,
    /// Echo loop running.
    Serving,
    /// Connection finished.
    Closed,
}

impl IdentityState {
    /// Whether `next` may follow this state.
    pub fn can_advance_to(self, next: Self) -> bool {
        use IdentityState::*;
        matches!(
            (self, next),
            (AwaitingAuthRequest, ChallengeSent)
                | (ChallengeSent, AwaitingChallengeResponse)
                | (AwaitingChallengeResponse, Registered)
                | (Registered, Serving)
                | (_, Closed)
        )
    }
}

/// Validate an auth request and return the proven-shape identity and key bytes.
///
/// The error is the reason sent to the client.
pub fn verify_auth_request(text: &str) -> Result<(PeerId, Vec<u8>), &'static str> {
    let request: IdentityAuthRequest = envelope_data(text)
        .ok()
        .and_then(|data| decode_data(&data).ok())
        .ok_or("invalid auth message")?;

    let public_key = hex::decode(&request.pubkey).map_err(|_| "invalid public key")?;
    let peer = PeerId::from_public_key(&public_key).map_err(|_| "invalid public key")?;

    match PeerId::parse(&request.peer_id) {
        Ok(claimed) if claimed == peer => Ok((peer, public_key)),
        _ => Err("peer id does not match public key"),
    }
}

/// Whether `text` answers the challenge for `nonce`.
pub fn verify_challenge_response(text: &str, nonce: &[u8]) -> bool {
    let Some(response) = envelope_data(text)
        .ok()
        .and_then(|data| decode_data::<ChallengeResponse>(&data).ok())
    else {
        return false;
    };
    let Ok(answer) = hex::decode(response.nonce) else {
        return false;
    };
    answer.len() == nonce.len() && bool::from(answer.ct_eq(nonce))
}

/// A per-connection identity-proof session.
pub struct IdentitySession {
    relay: Arc<WebRelay>,
    conn: WsConnection,
    state: IdentityState,
}

impl IdentitySession {
    /// Create a new session for an upgraded socket.
    pub fn new(relay: Arc<WebRelay>, socket: WebSocket) -> Self {
        let queue_size = relay.config().server.outbound_queue_size;
        Self {
            relay,
            conn: WsConnection::new(socket, queue_size),
            state: IdentityState::AwaitingAuthRequest,
        }
    }

    fn advance(&mut self, next: IdentityState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal identity transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!("Identity session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the session until completion.
    pub async fn run(mut self) -> ProtocolResult<()> {
        let relay = self.relay.clone();
        let timeout_secs = relay.config().server.auth_timeout_secs;

        let text = match self.read_auth_frame(timeout_secs).await {
            Ok(text) => text,
            Err(ProtocolError::InvalidMessage { .. }) => {
                RelayMetrics::incr(&relay.metrics().auth_failures);
                return Err(self.conn.reject("invalid auth message").await);
            }
            Err(e) => {
                self.conn.close().await;
                return Err(e);
            }
        };

        let (peer, public_key) = match verify_auth_request(&text) {
            Ok(verified) => verified,
            Err(reason) => {
                RelayMetrics::incr(&relay.metrics().auth_failures);
                return Err(self.conn.reject(reason).await);
            }
        };

        let nonce: [u8; CHALLENGE_NONCE_SIZE] = rand::random();
        let challenge = match encrypt_challenge(&public_key, &nonce) {
            Ok(challenge) => challenge,
            Err(e) => {
                tracing::warn!("Challenge encryption for {} failed: {}", peer, e);
                RelayMetrics::incr(&relay.metrics().auth_failures);
                return Err(self.conn.reject("invalid public key").await);
            }
        };
        self.conn.send(&ServerFrame::Challenge {
            challenge: hex::encode(challenge),
        })?;
        self.advance(IdentityState::ChallengeSent);
        tracing::debug!("Challenge sent to {}", peer);

        self.advance(IdentityState::AwaitingChallengeResponse);
        let response = match self.read_auth_frame(timeout_secs).await {
            Ok(text) => Some(text),
            Err(ProtocolError::InvalidMessage { .. }) => None,
            Err(e) => {
                self.conn.close().await;
                return Err(e);
            }
        };

        if !response.is_some_and(|text| verify_challenge_response(&text, &nonce)) {
            tracing::info!("Challenge failed for {}", peer);
            RelayMetrics::incr(&relay.metrics().auth_failures);
            if let Err(e) = self.conn.send(&ServerFrame::Auth { auth: false }) {
                tracing::debug!("Could not send auth result: {}", e);
            }
            self.advance(IdentityState::Closed);
            self.conn.close().await;
            return Err(ProtocolError::AuthFailed {
                reason: "challenge response mismatch".to_string(),
            });
        }

        let handle = ConnectionHandle::live(self.conn.outbound());
        let connection_id = handle.id();
        let registration = relay.peers().register(peer, handle.clone());
        handle.send(encode(&ServerFrame::Auth { auth: true })?)?;
        RelayMetrics::incr(&relay.metrics().auth_successes);
        self.advance(IdentityState::Registered);
        tracing::info!("Connection {} proved identity {}", connection_id, peer);

        self.advance(IdentityState::Serving);
        loop {
            match self.conn.next_frame().await {
                Ok(ClientFrame::Text(text)) => {
                    if let Err(e) = relay.rate_limits().check_frame(connection_id) {
                        RelayMetrics::incr(&relay.metrics().rate_limit_hits);
                        relay.reporter().report(
                            ReportKind::RateLimited,
                            Some(connection_id),
                            e.to_string(),
                        );
                        continue;
                    }
                    match handle.send(text) {
                        Ok(()) => {}
                        Err(ProtocolError::QueueFull) => {
                            RelayMetrics::incr(&relay.metrics().delivery_errors);
                            relay.reporter().report(
                                ReportKind::Delivery,
                                Some(connection_id),
                                "echo dropped: outbound queue full".to_string(),
                            );
                        }
                        Err(_) => break,
                    }
                }
                Ok(ClientFrame::Binary(len)) => {
                    tracing::debug!("Ignoring {}-byte binary frame from {}", len, peer);
                }
                Err(e) => {
                    tracing::debug!("Identity connection {} ended: {}", connection_id, e);
                    break;
                }
            }
        }

        drop(registration);
        drop(handle);
        self.advance(IdentityState::Closed);
        self.conn.close().await;
        Ok(())
    }

    /// Read one text frame within the auth deadline.
    async fn read_auth_frame(&mut self, timeout_secs: u64) -> ProtocolResult<String> {
        match self.conn.next_frame_within(timeout_secs).await {
            Ok(ClientFrame::Text(text)) => Ok(text),
            Ok(ClientFrame::Binary(_)) => Err(ProtocolError::InvalidMessage {
                reason: "binary frame during authentication".to_string(),
            }),
            Err(e) => {
                if let ProtocolError::AuthTimeout { secs } = e {
                    tracing::warn!("Identity auth timeout ({}s), closing connection", secs);
                    RelayMetrics::incr(&self.relay.metrics().auth_failures);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    fn signing_key() -> SigningKey {
        SigningKey::generate(&mut rand::rngs::OsRng)
    }

    fn request(key: &SigningKey) -> String {
        let public = key.verifying_key();
        json!({
            "peerID": hex::encode(public.as_bytes()),
            "pubkey": hex::encode(public.as_bytes()),
        })
        .to_string()
    }

    #[test]
    fn matching_request_is_verified() {
        let key = signing_key();
        let (peer, public_key) = verify_auth_request(&request(&key)).unwrap();
        assert_eq!(peer.as_bytes(), key.verifying_key().as_bytes());
        assert_eq!(public_key, key.verifying_key().as_bytes().to_vec());
    }

    #[test]
    fn enveloped_request_is_verified() {
        let key = signing_key();
        let public = hex::encode(key.verifying_key().as_bytes());
        let text = json!({
            "Type": "AuthRequest",
            "Data": {"peerID": public, "pubkey": public},
        })
        .to_string();
        assert!(verify_auth_request(&text).is_ok());
    }

    #[test]
    fn request_errors_match_wire_reasons() {
        assert_eq!(verify_auth_request("{}"), Err("invalid auth message"));
        assert_eq!(verify_auth_request("nonsense"), Err("invalid auth message"));

        let not_hex = json!({"peerID": "x", "pubkey": "zz"}).to_string();
        assert_eq!(verify_auth_request(&not_hex), Err("invalid public key"));

        let short = json!({"peerID": "x", "pubkey": "abcd"}).to_string();
        assert_eq!(verify_auth_request(&short), Err("invalid public key"));

        let key = signing_key();
        let other = signing_key();
        let mismatched = json!({
            "peerID": hex::encode(other.verifying_key().as_bytes()),
            "pubkey": hex::encode(key.verifying_key().as_bytes()),
        })
        .to_string();
        assert_eq!(
            verify_auth_request(&mismatched),
            Err("peer id does not match public key")
        );
    }

    #[test]
    fn identity_states_advance_in_order() {
        use IdentityState::*;
        let sequence = [
            AwaitingAuthRequest,
            ChallengeSent,
            AwaitingChallengeResponse,
            Registered,
            Serving,
            Closed,
        ];
        for pair in sequence.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn identity_states_cannot_skip_the_challenge() {
        use IdentityState::*;
        assert!(!AwaitingAuthRequest.can_advance_to(Registered));
        assert!(!ChallengeSent.can_advance_to(Serving));
        assert!(!Serving.can_advance_to(AwaitingChallengeResponse));
        assert!(AwaitingChallengeResponse.can_advance_to(Closed));
    }

    #[test]
    fn challenge_response_must_match_exactly() {
        let nonce = [9u8; CHALLENGE_NONCE_SIZE];
        let right = json!({"nonce": hex::encode(nonce)}).to_string();
        let wrong = json!({"nonce": hex::encode([8u8; CHALLENGE_NONCE_SIZE])}).to_string();
        let short = json!({"nonce": hex::encode(&nonce[..16])}).to_string();

        assert!(verify_challenge_response(&right, &nonce));
        assert!(!verify_challenge_response(&wrong, &nonce));
        assert!(!verify_challenge_response(&short, &nonce));
        assert!(!verify_challenge_response(r#"{"nonce": "not hex"}"#, &nonce));
        assert!(!verify_challenge_response("garbage", &nonce));
    }
}
