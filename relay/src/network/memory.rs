//! In-process network for tests and single-node deployments.

use super::{Network, TopicHub, TopicStream};
use crate::error::NetworkError;
use async_trait::async_trait;
use relay_types::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Network that keeps everything inside the process.
///
/// Payloads enter through [`MemoryNetwork::publish`]. Direct sends have no
/// peer to reach and are dropped, unless the network was built with
/// [`MemoryNetwork::recording`], in which case they can be inspected with
/// [`MemoryNetwork::sent`].
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    hub: TopicHub,
    sent: Option<Mutex<Vec<(PeerId, Vec<u8>)>>>,
    fail_sends: AtomicBool,
    fail_subscribes: AtomicBool,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a network that keeps every direct send.
    pub fn recording() -> Self {
        Self {
            sent: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Publish `payload` on `topic` as if a remote peer had sent it.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        self.hub.publish(topic, payload.to_vec()).await
    }

    /// End the subscription for `topic`.
    pub fn close_topic(&self, topic: &str) -> bool {
        self.hub.close(topic)
    }

    /// Direct sends so far, oldest first. Always empty unless recording.
    pub fn sent(&self) -> Vec<(PeerId, Vec<u8>)> {
        self.sent
            .as_ref()
            .and_then(|sent| sent.lock().ok().map(|s| s.clone()))
            .unwrap_or_default()
    }

    /// Make subsequent direct sends fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent subscriptions fail.
    pub fn fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn subscriptions(&self) -> Vec<String> {
        self.hub.subscriptions()
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicStream, NetworkError> {
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(NetworkError::Subscribe {
                topic: topic.to_string(),
                reason: "subscriptions disabled".to_string(),
            });
        }
        self.hub.subscribe(topic)
    }

    async fn send_direct(&self, peer: &PeerId, payload: &[u8]) -> Result<(), NetworkError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(NetworkError::Send {
                peer: peer.to_string(),
                reason: "peer unreachable".to_string(),
            });
        }
        match &self.sent {
            Some(sent) => sent
                .lock()
                .map_err(|_| NetworkError::Closed)?
                .push((*peer, payload.to_vec())),
            None => tracing::debug!("Dropping {} bytes for {}", payload.len(), peer),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn peer() -> PeerId {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        PeerId::from_public_key(key.verifying_key().as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn direct_sends_are_recorded() {
        let network = MemoryNetwork::recording();
        let to = peer();
        network.send_direct(&to, b"hi").await.unwrap();

        assert_eq!(network.sent(), vec![(to, b"hi".to_vec())]);
    }

    #[tokio::test]
    async fn direct_sends_are_not_kept_by_default() {
        let network = MemoryNetwork::new();
        for _ in 0..100 {
            network.send_direct(&peer(), b"payload").await.unwrap();
        }

        assert!(network.sent.is_none());
        assert!(network.sent().is_empty());
    }

    #[tokio::test]
    async fn failures_can_be_injected() {
        let network = MemoryNetwork::recording();
        network.fail_sends(true);
        network.fail_subscribes(true);

        assert!(network.send_direct(&peer(), b"hi").await.is_err());
        assert!(network.subscribe("t").await.is_err());
        assert!(network.sent().is_empty());
        assert!(network.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn subscriptions_track_live_topics() {
        let network = MemoryNetwork::new();
        let mut rx = network.subscribe("t").await.unwrap();
        assert_eq!(network.subscriptions().await, vec!["t".to_string()]);

        assert!(network.publish("t", b"payload").await);
        assert_eq!(rx.recv().await.unwrap(), b"payload");

        network.close_topic("t");
        assert!(rx.recv().await.is_none());
    }
}
