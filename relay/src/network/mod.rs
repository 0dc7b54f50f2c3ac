//! P2P network capability consumed by the relay engine.
//!
//! The relay only needs three things from the network: subscribe to a topic
//! and receive its payloads, send bytes directly to a peer, and list the
//! topics it is currently subscribed to.

mod hub;
mod iroh;
mod memory;

pub use self::iroh::{IrohNetwork, ALPN};
pub use hub::TopicHub;
pub use memory::MemoryNetwork;

use crate::error::NetworkError;
use async_trait::async_trait;
use relay_types::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Maximum encoded frame size on the network wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Stream of payloads published to one topic. Ends when the subscription does.
pub type TopicStream = mpsc::Receiver<Vec<u8>>;

/// Trait for the P2P node backing the relay.
#[async_trait]
pub trait Network: Send + Sync {
    /// Topics with a live subscription.
    async fn subscriptions(&self) -> Vec<String>;

    /// Subscribe to `topic`.
    ///
    /// Fails if the topic already has a live subscription.
    async fn subscribe(&self, topic: &str) -> Result<TopicStream, NetworkError>;

    /// Send `payload` directly to `peer`.
    async fn send_direct(&self, peer: &PeerId, payload: &[u8]) -> Result<(), NetworkError>;
}

/// One frame on a network stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkFrame {
    /// A payload published to a topic (peer to relay).
    Publish {
        /// Topic name.
        topic: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// A payload addressed to the receiving peer (relay to peer).
    Direct {
        /// Opaque payload.
        payload: Vec<u8>,
    },
}

impl NetworkFrame {
    /// Encode as a 4-byte big-endian length prefix followed by MessagePack.
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let body = rmp_serde::to_vec(self).map_err(|e| NetworkError::Send {
            peer: String::new(),
            reason: format!("encode failed: {e}"),
        })?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(NetworkError::Send {
                peer: String::new(),
                reason: format!("frame too large: {} > {}", body.len(), MAX_FRAME_SIZE),
            });
        }

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_has_length_prefix() {
        let frame = NetworkFrame::Publish {
            topic: "/offlinemessage/abc".to_string(),
            payload: b"hello".to_vec(),
        };
        let bytes = frame.encode().unwrap();

        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(NetworkFrame::decode(&bytes[4..]).unwrap(), frame);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = NetworkFrame::Direct {
            payload: vec![0u8; MAX_FRAME_SIZE + 1],
        };
        assert!(frame.encode().is_err());
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(NetworkFrame::decode(&[0xc1, 0x00, 0xff]).is_err());
    }
}
