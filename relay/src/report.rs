//! Non-fatal error reporting.
//!
//! Failures that must not end a session (a bad frame, a failed delivery, a
//! store hiccup during replay) are logged and broadcast as [`Report`]s.
//! Observers, tests included, subscribe to the broadcast.

use std::fmt;
use tokio::sync::broadcast;

/// Reports buffered per slow observer before it starts lagging.
const REPORT_CAPACITY: usize = 256;

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// A frame could not be decoded (bad JSON, bad base64, bad id).
    Decode,
    /// A frame decoded as none of the known message shapes.
    DecodeAmbiguity,
    /// A frame could not be pushed to a connection or peer.
    Delivery,
    /// A store operation failed.
    Storage,
    /// A frame was dropped by the per-connection rate limit.
    RateLimited,
    /// The network subscription for a topic ended or failed.
    Network,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decode => "decode",
            Self::DecodeAmbiguity => "decode_ambiguity",
            Self::Delivery => "delivery",
            Self::Storage => "storage",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
        };
        f.write_str(name)
    }
}

/// One reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// What kind of failure.
    pub kind: ReportKind,
    /// Connection the failure belongs to, if any.
    pub connection: Option<u64>,
    /// Human-readable detail.
    pub detail: String,
}

/// Broadcasts [`Report`]s and logs them.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: broadcast::Sender<Report>,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    /// Create a reporter with no observers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REPORT_CAPACITY);
        Self { tx }
    }

    /// Observe reports made from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.tx.subscribe()
    }

    /// Log and broadcast a failure.
    pub fn report(&self, kind: ReportKind, connection: Option<u64>, detail: impl Into<String>) {
        let detail = detail.into();
        match connection {
            Some(id) => tracing::warn!(kind = %kind, connection = id, "{}", detail),
            None => tracing::warn!(kind = %kind, "{}", detail),
        }
        // No observers is fine.
        let _ = self.tx.send(Report {
            kind,
            connection,
            detail,
        });
    }
}
