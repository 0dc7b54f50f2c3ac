//! Error types for webrelay.

use std::path::PathBuf;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network error.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Challenge crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Message not found.
    #[error("message not found: {message_id}")]
    NotFound {
        /// The message ID that was not found.
        message_id: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt record: {reason}")]
    Corrupt {
        /// What was wrong with the record.
        reason: String,
    },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    ///
    /// SQLite reports lock contention as `SQLITE_BUSY` (5) or
    /// `SQLITE_LOCKED` (6); a pool timeout means every connection was busy.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Database(sqlx::Error::PoolTimedOut) => true,
            StorageError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("5") | Some("6"))
            }
            _ => false,
        }
    }
}

/// Protocol layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Missing or malformed fields.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Reason the message is invalid.
        reason: String,
    },

    /// No frame arrived before the authentication deadline.
    #[error("authentication timed out after {secs}s")]
    AuthTimeout {
        /// The deadline in seconds.
        secs: u64,
    },

    /// Challenge or identity mismatch.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Why authentication failed.
        reason: String,
    },

    /// Transport-level failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The client closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// The connection's outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
}

/// Errors from the P2P network capability.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Subscribing to a topic failed.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// The topic.
        topic: String,
        /// Failure reason.
        reason: String,
    },

    /// Direct send to a peer failed.
    #[error("send to {peer} failed: {reason}")]
    Send {
        /// The destination peer.
        peer: String,
        /// Failure reason.
        reason: String,
    },

    /// The peer identity cannot be addressed on this network.
    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    /// The network endpoint could not be created.
    #[error("failed to bind endpoint: {0}")]
    Bind(String),

    /// The network has shut down.
    #[error("network closed")]
    Closed,
}

/// Challenge crypto errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key is not an Ed25519 public key.
    #[error("unsupported key type: expected an ed25519 public key")]
    UnsupportedKeyType,

    /// Ciphertext is truncated or fails authentication.
    #[error("invalid ciphertext")]
    InvalidCiphertext,

    /// Sealing failed.
    #[error("seal failed")]
    Seal,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
