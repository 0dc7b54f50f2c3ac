//! Rate limiting for webrelay.
//!
//! Provides protection against connection flooding and frame spam.
//!
//! ## Design Notes
//!
//! WebSocket clients are identified by their socket's IP address for
//! connection attempts, and by the relay-assigned connection id for frames
//! received while serving. Both use governor's keyed rate limiters backed
//! by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Rate limiters for the relay server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per client IP.
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,

    /// Limits inbound frames per serving connection.
    frame_limiter: Arc<KeyedLimiter<u64>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("frame_limiter", &"KeyedLimiter<u64>")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// A configured quota of zero is treated as one per minute.
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(per_minute(config.connections_per_minute));
        let frame_quota = Quota::per_minute(per_minute(config.frames_per_minute));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            frame_limiter: Arc::new(RateLimiter::keyed(frame_quota)),
        }
    }

    /// Check if a connection attempt from `ip` is allowed.
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if connection `connection_id` may send another frame.
    pub fn check_frame(&self, connection_id: u64) -> Result<(), RateLimitError> {
        self.frame_limiter
            .check_key(&connection_id)
            .map_err(|_| RateLimitError::FrameLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked frame keys (for metrics).
    pub fn frame_keys_count(&self) -> usize {
        self.frame_limiter.len()
    }

    /// Evict entries whose rate limit cells have fully recharged.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.frame_limiter.retain_recent();
    }

    /// Spawn a task that calls [`RateLimits::shrink`] every `every`.
    pub fn spawn_maintenance(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let limits = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            loop {
                timer.tick().await;
                limits.shrink();
                tracing::debug!(
                    "Rate limiter maintenance: {} connection keys, {} frame keys",
                    limits.connection_keys_count(),
                    limits.frame_keys_count()
                );
            }
        })
    }
}

fn per_minute(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    ConnectionLimitExceeded,
    /// Too many frames on this connection.
    FrameLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => {
                write!(f, "connection rate limit exceeded")
            }
            Self::FrameLimitExceeded => {
                write!(f, "frame rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
