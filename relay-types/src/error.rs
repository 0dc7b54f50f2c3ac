//! Error types for webrelay wire types.

use thiserror::Error;

/// Errors produced while parsing identifiers or decoding frames.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Subscription key is not a base58-encoded multihash
    #[error("invalid subscription key: {0}")]
    InvalidSubscriptionKey(String),

    /// Peer identity is not a hex-encoded Ed25519 public key
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Message id is not a hex-encoded SHA-256 digest
    #[error("invalid message id: {0}")]
    InvalidMessageId(String),

    /// Frame is not a JSON object
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame is JSON but matches no known message shape
    #[error("unknown message type")]
    UnknownMessage,

    /// JSON encoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TypesError::InvalidPeerId("too short".to_string());
        assert_eq!(err.to_string(), "invalid peer id: too short");
        assert_eq!(TypesError::UnknownMessage.to_string(), "unknown message type");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypesError>();
    }
}
