//! Main WebRelay server coordination.
//!
//! WebRelay owns the message store, the network, and the live connection
//! registries, and runs one fan-out loop per subscribed topic.

use crate::config::Config;
use crate::error::{NetworkError, StorageError};
use crate::fanout;
use crate::limits::RateLimits;
use crate::network::Network;
use crate::registry::ConnectionRegistry;
use crate::report::{ReportKind, Reporter};
use crate::storage::MessageStore;
use relay_types::{PeerId, SubscriptionKey};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total WebSocket connections accepted.
    pub connections_total: AtomicU64,
    /// Connections that completed authentication.
    pub auth_successes: AtomicU64,
    /// Connections rejected or timed out during authentication.
    pub auth_failures: AtomicU64,
    /// Payloads persisted by fan-out loops.
    pub messages_stored: AtomicU64,
    /// Live frames queued to connections.
    pub live_delivered: AtomicU64,
    /// Stored frames replayed after authentication.
    pub replayed: AtomicU64,
    /// Client messages handed to the network.
    pub outbound_relayed: AtomicU64,
    /// Read acknowledgements recorded.
    pub acks: AtomicU64,
    /// Failed pushes to connections or peers.
    pub delivery_errors: AtomicU64,
    /// Total rate limit rejections (connections and frames).
    pub rate_limit_hits: AtomicU64,
}

impl RelayMetrics {
    /// Add one to `counter`.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Main relay server.
pub struct WebRelay {
    config: Config,
    store: Arc<dyn MessageStore>,
    network: Arc<dyn Network>,
    /// Live connections per subscription.
    topics: ConnectionRegistry<SubscriptionKey>,
    /// Live identity-proof connections per peer.
    peers: ConnectionRegistry<PeerId>,
    /// Running fan-out loops and their generation.
    fanout_loops: Mutex<HashMap<SubscriptionKey, u64>>,
    next_generation: AtomicU64,
    rate_limits: RateLimits,
    metrics: RelayMetrics,
    reporter: Reporter,
}

impl std::fmt::Debug for WebRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("topics", &self.topics.key_count())
            .field("peers", &self.peers.key_count())
            .finish_non_exhaustive()
    }
}

impl WebRelay {
    /// Create a new WebRelay with the given config, store and network.
    pub fn new(config: Config, store: Arc<dyn MessageStore>, network: Arc<dyn Network>) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        Self {
            config,
            store,
            network,
            topics: ConnectionRegistry::new(),
            peers: ConnectionRegistry::new(),
            fanout_loops: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            rate_limits,
            metrics: RelayMetrics::default(),
            reporter: Reporter::new(),
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the message store.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Get access to the network.
    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    /// Live connections per subscription.
    pub fn topics(&self) -> &ConnectionRegistry<SubscriptionKey> {
        &self.topics
    }

    /// Live identity-proof connections per peer.
    pub fn peers(&self) -> &ConnectionRegistry<PeerId> {
        &self.peers
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Get the non-fatal error reporter.
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Number of live connections across both registries.
    pub fn total_connections(&self) -> usize {
        self.topics.connection_count() + self.peers.connection_count()
    }

    /// Number of running fan-out loops.
    pub async fn fanout_count(&self) -> usize {
        self.fanout_loops.lock().await.len()
    }

    /// Make sure `key` has a network subscription and a fan-out loop.
    ///
    /// The first caller subscribes and spawns the loop; concurrent and later
    /// callers see it running. Returns whether a new loop was started.
    pub async fn ensure_subscribed(
        self: &Arc<Self>,
        key: &SubscriptionKey,
    ) -> Result<bool, NetworkError> {
        let topic = key.topic();
        let mut loops = self.fanout_loops.lock().await;

        let live = self.network.subscriptions().await.contains(&topic);
        if live && loops.contains_key(key) {
            return Ok(false);
        }

        let stream = self.network.subscribe(&topic).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        loops.insert(key.clone(), generation);
        drop(loops);

        tracing::info!("Subscribed to {}", topic);
        tokio::spawn(fanout::run(self.clone(), key.clone(), stream, generation));
        Ok(true)
    }

    /// Forget the fan-out loop for `key` if it is still `generation`.
    pub(crate) async fn fanout_finished(&self, key: &SubscriptionKey, generation: u64) {
        let mut loops = self.fanout_loops.lock().await;
        if loops.get(key) == Some(&generation) {
            loops.remove(key);
        }
    }

    /// Restart fan-out for every subscription the store knows about.
    ///
    /// Returns the number of loops started.
    pub async fn resume_subscriptions(self: &Arc<Self>) -> Result<usize, StorageError> {
        let store = self.store.clone();
        let keys = self
            .with_retry("list_subscriptions", move || {
                let store = store.clone();
                async move { store.list_subscriptions().await }
            })
            .await?;

        let mut started = 0;
        for key in &keys {
            match self.ensure_subscribed(key).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => self.reporter.report(
                    ReportKind::Network,
                    None,
                    format!("resume {} failed: {}", key, e),
                ),
            }
        }

        tracing::info!("Resumed {}/{} subscriptions", started, keys.len());
        Ok(started)
    }

    /// Run a store operation, retrying transient failures.
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.config.storage.retry_attempts.max(1);
        let backoff = self.config.storage.retry_backoff_ms;
        let mut attempt = 1;

        loop {
            match f().await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying: {}",
                        operation,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff * attempt as u64)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use crate::storage::MemoryStore;
    use std::sync::atomic::AtomicU32;

    fn test_relay() -> (Arc<WebRelay>, Arc<MemoryNetwork>) {
        let network = Arc::new(MemoryNetwork::new());
        let relay = WebRelay::new(Config::default(), Arc::new(MemoryStore::new()), network.clone());
        (Arc::new(relay), network)
    }

    fn key(seed: &str) -> SubscriptionKey {
        SubscriptionKey::from_sha256(seed.as_bytes())
    }

    #[tokio::test]
    async fn ensure_subscribed_starts_one_loop() {
        let (relay, network) = test_relay();
        let k = key("topic");

        assert!(relay.ensure_subscribed(&k).await.unwrap());
        assert!(!relay.ensure_subscribed(&k).await.unwrap());

        assert_eq!(network.subscriptions().await, vec![k.topic()]);
        assert_eq!(relay.fanout_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_subscribed_starts_one_loop() {
        let (relay, _network) = test_relay();
        let k = key("contended");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let relay = relay.clone();
            let k = k.clone();
            tasks.push(tokio::spawn(async move { relay.ensure_subscribed(&k).await }));
        }

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn subscribe_failure_is_returned() {
        let (relay, network) = test_relay();
        network.fail_subscribes(true);

        assert!(relay.ensure_subscribed(&key("t")).await.is_err());
        assert_eq!(relay.fanout_count().await, 0);
    }

    #[tokio::test]
    async fn ended_loop_can_be_restarted() {
        let (relay, network) = test_relay();
        let k = key("restart");
        relay.ensure_subscribed(&k).await.unwrap();

        network.close_topic(&k.topic());
        for _ in 0..100 {
            if relay.fanout_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relay.fanout_count().await, 0);

        assert!(relay.ensure_subscribed(&k).await.unwrap());
    }

    #[tokio::test]
    async fn resume_subscribes_every_stored_key() {
        let (relay, network) = test_relay();
        relay.store().add_subscription(&key("a")).await.unwrap();
        relay.store().add_subscription(&key("b")).await.unwrap();

        assert_eq!(relay.resume_subscriptions().await.unwrap(), 2);

        let mut topics = network.subscriptions().await;
        topics.sort();
        let mut expected = vec![key("a").topic(), key("b").topic()];
        expected.sort();
        assert_eq!(topics, expected);
    }

    #[tokio::test]
    async fn with_retry_retries_transient_errors() {
        let (relay, _network) = test_relay();
        let calls = AtomicU32::new(0);

        let result = relay
            .with_retry("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StorageError::Database(sqlx::Error::PoolTimedOut))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_gives_up_on_permanent_errors() {
        let (relay, _network) = test_relay();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = relay
            .with_retry("missing", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StorageError::NotFound {
                        message_id: "x".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
