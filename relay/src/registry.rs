//! Live connection registry.
//!
//! Maps a key (subscription or peer identity) to the connections currently
//! interested in it. Each [`ConnectionHandle`] owns the sending side of its
//! connection's outbound queue; a writer task drains the queue to the socket.

use crate::error::ProtocolError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_types::MessageId;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::mpsc::Sender;
use tokio::time::Instant;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Poll interval while a release waits for queue room.
const RELEASE_POLL: Duration = Duration::from_millis(5);

type HeldFrames = Option<Vec<(MessageId, String)>>;

/// Handle to one live connection's bounded outbound queue.
///
/// A handle created with [`ConnectionHandle::held`] buffers live frames until
/// [`ConnectionHandle::release`] is called, so a session can finish its replay
/// before any live frame reaches the client. The hold buffer is capped at the
/// queue's capacity.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    outbound: Sender<String>,
    held: Mutex<HeldFrames>,
}

impl ConnectionHandle {
    /// A handle that delivers live frames immediately.
    pub fn live(outbound: Sender<String>) -> Arc<Self> {
        Arc::new(Self::with_state(outbound, None))
    }

    /// A handle that buffers live frames until released.
    pub fn held(outbound: Sender<String>) -> Arc<Self> {
        Arc::new(Self::with_state(outbound, Some(Vec::new())))
    }

    fn with_state(outbound: Sender<String>, held: HeldFrames) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            held: Mutex::new(held),
        }
    }

    fn lock_held(&self) -> Result<MutexGuard<'_, HeldFrames>, ProtocolError> {
        self.held
            .lock()
            .map_err(|_| ProtocolError::Connection("handle lock poisoned".to_string()))
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queue a frame without waiting, bypassing the hold.
    ///
    /// Fails with [`ProtocolError::QueueFull`] when the client is not
    /// draining its queue.
    pub fn send(&self, frame: String) -> Result<(), ProtocolError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::QueueFull,
            TrySendError::Closed(_) => ProtocolError::Closed,
        })
    }

    /// Queue a frame, waiting up to `wait` for room. Bypasses the hold.
    pub async fn send_wait(&self, frame: String, wait: Duration) -> Result<(), ProtocolError> {
        self.outbound
            .send_timeout(frame, wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ProtocolError::QueueFull,
                SendTimeoutError::Closed(_) => ProtocolError::Closed,
            })
    }

    /// Queue a live message frame, buffering it while the handle is held.
    pub fn deliver(&self, id: &MessageId, frame: String) -> Result<(), ProtocolError> {
        let mut held = self.lock_held()?;
        if let Some(buffer) = held.as_mut() {
            if self.outbound.is_closed() {
                return Err(ProtocolError::Closed);
            }
            if buffer.len() >= self.outbound.max_capacity() {
                return Err(ProtocolError::QueueFull);
            }
            buffer.push((id.clone(), frame));
            return Ok(());
        }
        self.send(frame)
    }

    /// Flush buffered live frames and switch to direct delivery.
    ///
    /// Frames whose id is in `already_sent` are dropped. Waits up to `wait`
    /// for the queue to have room for the rest; after that, whatever does
    /// not fit is dropped and [`ProtocolError::QueueFull`] is returned.
    /// Either way the handle is live afterwards. Returns the number of
    /// frames flushed.
    pub async fn release(
        &self,
        already_sent: &HashSet<MessageId>,
        wait: Duration,
    ) -> Result<usize, ProtocolError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(flushed) = self.try_release(already_sent, Instant::now() >= deadline)? {
                return Ok(flushed);
            }
            tokio::time::sleep(RELEASE_POLL).await;
        }
    }

    /// One release attempt. `None` means the queue has no room yet.
    fn try_release(
        &self,
        already_sent: &HashSet<MessageId>,
        force: bool,
    ) -> Result<Option<usize>, ProtocolError> {
        let mut held = self.lock_held()?;
        let Some(buffer) = held.as_mut() else {
            return Ok(Some(0));
        };
        buffer.retain(|(id, _)| !already_sent.contains(id));
        if buffer.len() > self.outbound.capacity() && !force && !self.outbound.is_closed() {
            return Ok(None);
        }

        let buffer = held.take().unwrap_or_default();
        let mut flushed = 0;
        for (_, frame) in buffer {
            // Stop at the first failure so later frames never overtake it.
            self.send(frame)?;
            flushed += 1;
        }
        Ok(Some(flushed))
    }
}

/// Concurrent map from a key to the live connections registered under it.
///
/// Mutation and snapshots are atomic per key; no lock is held across an
/// await. A key is removed as soon as its last connection deregisters.
#[derive(Debug)]
pub struct ConnectionRegistry<K: Eq + Hash> {
    entries: DashMap<K, Vec<Arc<ConnectionHandle>>>,
}

impl<K: Eq + Hash + Clone> Default for ConnectionRegistry<K> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> ConnectionRegistry<K> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under `key`.
    ///
    /// The returned guard deregisters the handle when dropped.
    pub fn register(&self, key: K, handle: Arc<ConnectionHandle>) -> Registration<'_, K> {
        let id = handle.id();
        let count = {
            let mut list = self.entries.entry(key.clone()).or_default();
            list.push(handle);
            list.len()
        };
        tracing::debug!("Registered connection {} under {:?} (total: {})", id, key, count);
        Registration {
            registry: self,
            key,
            id,
        }
    }

    /// Remove the connection `id` from `key`, dropping the key when it empties.
    pub fn deregister(&self, key: &K, id: u64) {
        if let Entry::Occupied(mut entry) = self.entries.entry(key.clone()) {
            entry.get_mut().retain(|handle| handle.id() != id);
            let remaining = entry.get().len();
            if remaining == 0 {
                entry.remove();
            }
            tracing::debug!(
                "Deregistered connection {} from {:?} (remaining: {})",
                id,
                key,
                remaining
            );
        }
    }

    /// The connections registered under `key` right now.
    pub fn snapshot(&self, key: &K) -> Vec<Arc<ConnectionHandle>> {
        self.entries
            .get(key)
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    /// Whether any connection is registered under `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys with at least one connection.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of registered connections across all keys.
    pub fn connection_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }
}

/// Scoped registration; deregisters on drop.
#[derive(Debug)]
pub struct Registration<'a, K: Eq + Hash + Clone + std::fmt::Debug> {
    registry: &'a ConnectionRegistry<K>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> Registration<'_, K> {
    /// The key this connection is registered under.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> Drop for Registration<'_, K> {
    fn drop(&mut self) {
        self.registry.deregister(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(1);

    fn id(payload: &str) -> MessageId {
        MessageId::for_payload(payload.as_bytes())
    }

    #[test]
    fn handle_ids_are_unique() {
        let (tx, _rx) = mpsc::channel(16);
        let a = ConnectionHandle::live(tx.clone());
        let b = ConnectionHandle::live(tx);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn held_handle_buffers_until_release() {
        let (tx, mut rx) = mpsc::channel(16);
        let handle = ConnectionHandle::held(tx);

        handle.deliver(&id("live-1"), "live-1".to_string()).unwrap();
        handle.send("replayed".to_string()).unwrap();
        handle.deliver(&id("live-2"), "live-2".to_string()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), "replayed");
        assert!(rx.try_recv().is_err());

        let mut replayed = HashSet::new();
        replayed.insert(id("live-2"));
        assert_eq!(handle.release(&replayed, WAIT).await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), "live-1");
        assert!(rx.try_recv().is_err());

        handle.deliver(&id("live-3"), "live-3".to_string()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "live-3");

        // A second release is a no-op.
        assert_eq!(handle.release(&HashSet::new(), WAIT).await.unwrap(), 0);
    }

    #[test]
    fn full_queue_fails_live_delivery() {
        let (tx, mut rx) = mpsc::channel(2);
        let handle = ConnectionHandle::live(tx);

        handle.deliver(&id("1"), "1".to_string()).unwrap();
        handle.deliver(&id("2"), "2".to_string()).unwrap();
        assert!(matches!(
            handle.deliver(&id("3"), "3".to_string()),
            Err(ProtocolError::QueueFull)
        ));

        // Draining makes room again.
        assert_eq!(rx.try_recv().unwrap(), "1");
        handle.deliver(&id("4"), "4".to_string()).unwrap();
    }

    #[test]
    fn hold_buffer_is_capped_at_queue_capacity() {
        let (tx, _rx) = mpsc::channel(2);
        let handle = ConnectionHandle::held(tx);

        handle.deliver(&id("1"), "1".to_string()).unwrap();
        handle.deliver(&id("2"), "2".to_string()).unwrap();
        assert!(matches!(
            handle.deliver(&id("3"), "3".to_string()),
            Err(ProtocolError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn release_waits_for_queue_room() {
        let (tx, mut rx) = mpsc::channel(2);
        let handle = ConnectionHandle::held(tx);
        handle.send("replay-1".to_string()).unwrap();
        handle.send("replay-2".to_string()).unwrap();
        handle.deliver(&id("live"), "live".to_string()).unwrap();

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut frames = Vec::new();
            while let Some(frame) = rx.recv().await {
                frames.push(frame);
                if frames.len() == 3 {
                    break;
                }
            }
            frames
        });

        assert_eq!(handle.release(&HashSet::new(), WAIT).await.unwrap(), 1);
        assert_eq!(reader.await.unwrap(), vec!["replay-1", "replay-2", "live"]);
    }

    #[tokio::test]
    async fn release_to_stuck_client_gives_up() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::held(tx);
        handle.send("replayed".to_string()).unwrap();
        handle.deliver(&id("live"), "live".to_string()).unwrap();

        let result = handle.release(&HashSet::new(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ProtocolError::QueueFull)));

        // The handle is live afterwards.
        assert!(matches!(
            handle.deliver(&id("next"), "next".to_string()),
            Err(ProtocolError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn send_wait_times_out_on_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::live(tx);
        handle.send("first".to_string()).unwrap();

        let result = handle
            .send_wait("second".to_string(), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(ProtocolError::QueueFull)));
    }

    #[test]
    fn deliver_to_closed_connection_fails() {
        let (tx, rx) = mpsc::channel(16);
        let live = ConnectionHandle::live(tx.clone());
        let held = ConnectionHandle::held(tx);
        drop(rx);

        assert!(matches!(
            live.deliver(&id("x"), "x".to_string()),
            Err(ProtocolError::Closed)
        ));
        assert!(matches!(
            held.deliver(&id("x"), "x".to_string()),
            Err(ProtocolError::Closed)
        ));
        assert!(live.is_closed());
    }

    #[test]
    fn registration_guard_removes_entry() {
        let registry: ConnectionRegistry<String> = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);

        let first = registry.register("topic".to_string(), ConnectionHandle::live(tx.clone()));
        let second = registry.register("topic".to_string(), ConnectionHandle::live(tx));
        assert_eq!(registry.snapshot(&"topic".to_string()).len(), 2);
        assert_eq!(first.key(), "topic");

        drop(first);
        assert_eq!(registry.snapshot(&"topic".to_string()).len(), 1);
        assert!(registry.contains_key(&"topic".to_string()));

        drop(second);
        assert!(!registry.contains_key(&"topic".to_string()));
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn deregister_unknown_key_is_noop() {
        let registry: ConnectionRegistry<String> = ConnectionRegistry::new();
        registry.deregister(&"missing".to_string(), 42);
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry: ConnectionRegistry<u8> = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(16);

        let guard = registry.register(1, ConnectionHandle::live(tx));
        let snapshot = registry.snapshot(&1);
        drop(guard);

        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot(&1).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_disconnect_leaves_nothing() {
        let registry: Arc<ConnectionRegistry<u8>> = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::channel(16);

        let mut tasks = Vec::new();
        for i in 0..200u32 {
            let registry = registry.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let key = (i % 5) as u8;
                let guard = registry.register(key, ConnectionHandle::live(tx));
                tokio::task::yield_now().await;
                assert!(registry.contains_key(&key));
                drop(guard);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.key_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }
}
