//! iroh QUIC network for the `/webrelay/1` ALPN.
//!
//! Every unidirectional stream carries exactly one length-prefixed
//! [`NetworkFrame`]. Peers publish into the relay's topics with
//! `Publish` frames; the relay reaches offline recipients with `Direct`
//! frames on a fresh connection.

use super::{Network, NetworkFrame, TopicHub, TopicStream, MAX_FRAME_SIZE};
use crate::error::NetworkError;
use async_trait::async_trait;
use iroh::endpoint::{Connection, RecvStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, PublicKey, SecretKey};
use relay_types::PeerId;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Protocol identifier for the relay's network wire.
pub const ALPN: &[u8] = b"/webrelay/1";

/// Deadline for dialing a peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Network`] backed by an iroh endpoint.
#[derive(Debug)]
pub struct IrohNetwork {
    endpoint: Endpoint,
    router: Router,
    hub: Arc<TopicHub>,
}

impl IrohNetwork {
    /// Bind an endpoint and start accepting `/webrelay/1` connections.
    ///
    /// A fresh identity is generated when `secret_key` is `None`.
    pub async fn bind(secret_key: Option<SecretKey>) -> Result<Self, NetworkError> {
        let mut builder = Endpoint::builder().alpns(vec![ALPN.to_vec()]);
        if let Some(key) = secret_key {
            builder = builder.secret_key(key);
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| NetworkError::Bind(e.to_string()))?;

        let hub = Arc::new(TopicHub::new());
        let router = Router::builder(endpoint.clone())
            .accept(ALPN, NetworkProtocol { hub: hub.clone() })
            .spawn();

        tracing::info!("iroh endpoint ready: {}", endpoint.id());
        Ok(Self {
            endpoint,
            router,
            hub,
        })
    }

    /// Load the endpoint secret key from `path`, creating it if missing.
    pub fn load_or_create_key(path: &Path) -> Result<SecretKey, NetworkError> {
        if path.exists() {
            let bytes = std::fs::read(path)
                .map_err(|e| NetworkError::Bind(format!("read {}: {e}", path.display())))?;
            let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                NetworkError::Bind(format!("{} is not a 32-byte secret key", path.display()))
            })?;
            return Ok(SecretKey::from_bytes(&bytes));
        }

        let bytes: [u8; 32] = rand::random();
        std::fs::write(path, bytes)
            .map_err(|e| NetworkError::Bind(format!("write {}: {e}", path.display())))?;
        tracing::info!("Generated new endpoint key at {}", path.display());
        Ok(SecretKey::from_bytes(&bytes))
    }

    /// This relay's identity on the network.
    pub fn peer_id(&self) -> PublicKey {
        self.endpoint.id()
    }

    /// Stop accepting connections and close the endpoint.
    pub async fn shutdown(&self) -> Result<(), NetworkError> {
        self.router
            .shutdown()
            .await
            .map_err(|e| NetworkError::Bind(format!("shutdown failed: {e}")))
    }
}

#[async_trait]
impl Network for IrohNetwork {
    async fn subscriptions(&self) -> Vec<String> {
        self.hub.subscriptions()
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicStream, NetworkError> {
        self.hub.subscribe(topic)
    }

    async fn send_direct(&self, peer: &PeerId, payload: &[u8]) -> Result<(), NetworkError> {
        let send_error = |reason: String| NetworkError::Send {
            peer: peer.to_string(),
            reason,
        };

        let remote = PublicKey::from_bytes(peer.as_bytes())
            .map_err(|e| NetworkError::InvalidPeer(e.to_string()))?;
        let frame = NetworkFrame::Direct {
            payload: payload.to_vec(),
        }
        .encode()?;

        let connection = tokio::time::timeout(CONNECT_TIMEOUT, self.endpoint.connect(remote, ALPN))
            .await
            .map_err(|_| send_error("connect timed out".to_string()))?
            .map_err(|e| send_error(format!("connect failed: {e}")))?;

        let mut send = connection
            .open_uni()
            .await
            .map_err(|e| send_error(format!("open_uni failed: {e}")))?;
        send.write_all(&frame)
            .await
            .map_err(|e| send_error(format!("write failed: {e}")))?;
        send.finish()
            .map_err(|e| send_error(format!("finish failed: {e}")))?;

        // Wait for the peer to acknowledge before the connection is dropped.
        send.stopped().await.ok();

        tracing::debug!("Sent {} bytes directly to {}", payload.len(), peer);
        Ok(())
    }
}

/// Accepts `Publish` frames from peers into the local topic hub.
#[derive(Clone, Debug)]
struct NetworkProtocol {
    hub: Arc<TopicHub>,
}

impl ProtocolHandler for NetworkProtocol {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let hub = self.hub.clone();
        async move {
            let remote_id = connection.remote_id();
            tracing::debug!("Network connection from {}", remote_id);

            loop {
                let mut recv = match connection.accept_uni().await {
                    Ok(recv) => recv,
                    Err(e) => {
                        tracing::debug!("Network connection from {} closed: {}", remote_id, e);
                        break;
                    }
                };

                match read_frame(&mut recv).await {
                    Ok(NetworkFrame::Publish { topic, payload }) => {
                        if !hub.publish(&topic, payload).await {
                            tracing::debug!("No subscriber for {} (from {})", topic, remote_id);
                        }
                    }
                    Ok(NetworkFrame::Direct { .. }) => {
                        tracing::debug!("Ignoring direct frame from {}", remote_id);
                    }
                    Err(reason) => {
                        tracing::warn!("Bad network frame from {}: {}", remote_id, reason);
                    }
                }
            }

            Ok(())
        }
    }
}

/// Read one length-prefixed frame from a stream.
async fn read_frame(recv: &mut RecvStream) -> Result<NetworkFrame, String> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| format!("read length failed: {e}"))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(format!("frame too large: {} > {}", len, MAX_FRAME_SIZE));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| format!("read frame failed: {e}"))?;

    NetworkFrame::decode(&buf).map_err(|e| format!("decode failed: {e}"))
}
