//! Message store for webrelay.
//!
//! Messages are content-addressed and indexed per subscription in arrival
//! order. Read markers are tracked per `(message, user)` so each reader
//! replays only what it has not acknowledged.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StorageResult;
use async_trait::async_trait;
use relay_types::{MessageId, SubscriptionKey};

/// A message persisted for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Content address of the payload.
    pub id: MessageId,
    /// Subscription the message was published to.
    pub subscription: SubscriptionKey,
    /// Opaque payload (the relay cannot decrypt it).
    pub payload: Vec<u8>,
}

/// Snapshot of the unread messages for one reader, in index order.
///
/// The snapshot is taken when [`MessageStore::get_messages`] returns; later
/// writes are not observed. Consumed once.
#[derive(Debug)]
pub struct Replay {
    messages: std::vec::IntoIter<StoredMessage>,
}

impl Replay {
    pub(crate) fn new(messages: Vec<StoredMessage>) -> Self {
        Self {
            messages: messages.into_iter(),
        }
    }

    /// An empty replay.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for Replay {
    type Item = StoredMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.messages.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.messages.size_hint()
    }
}

impl ExactSizeIterator for Replay {}

/// Trait for message store backends.
///
/// All methods are safe to call concurrently.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Start tracking a subscription. Idempotent.
    async fn add_subscription(&self, key: &SubscriptionKey) -> StorageResult<()>;

    /// Every tracked subscription.
    async fn list_subscriptions(&self) -> StorageResult<Vec<SubscriptionKey>>;

    /// Store a message and append it to the subscription's index.
    ///
    /// Storing the same id twice for a subscription leaves one index entry.
    async fn put_message(
        &self,
        key: &SubscriptionKey,
        id: &MessageId,
        payload: &[u8],
    ) -> StorageResult<()>;

    /// Messages indexed under `key` that `user_id` has not marked read.
    async fn get_messages(
        &self,
        user_id: &str,
        key: &SubscriptionKey,
    ) -> StorageResult<Replay>;

    /// Mark a message read for `user_id`.
    ///
    /// Fails with [`crate::error::StorageError::NotFound`] if the message is unknown.
    async fn mark_read(&self, id: &MessageId, user_id: &str) -> StorageResult<()>;

    /// Number of distinct stored messages.
    async fn message_count(&self) -> StorageResult<u64>;

    /// Number of tracked subscriptions.
    async fn subscription_count(&self) -> StorageResult<u64>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share, run against each one from its own tests.

    use super::*;
    use crate::error::StorageError;

    pub fn key(seed: &str) -> SubscriptionKey {
        SubscriptionKey::from_sha256(seed.as_bytes())
    }

    async fn put(store: &dyn MessageStore, key: &SubscriptionKey, payload: &[u8]) -> MessageId {
        let id = MessageId::for_payload(payload);
        store.put_message(key, &id, payload).await.unwrap();
        id
    }

    pub async fn subscriptions_are_idempotent(store: &dyn MessageStore) {
        let a = key("a");
        let b = key("b");
        store.add_subscription(&a).await.unwrap();
        store.add_subscription(&a).await.unwrap();
        store.add_subscription(&b).await.unwrap();

        let mut keys = store.list_subscriptions().await.unwrap();
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(store.subscription_count().await.unwrap(), 2);
    }

    pub async fn replay_is_in_insertion_order(store: &dyn MessageStore) {
        let topic = key("ordered");
        let mut ids = Vec::new();
        for payload in [b"third".as_slice(), b"first", b"second"] {
            ids.push(put(store, &topic, payload).await);
        }

        let replay = store.get_messages("alice", &topic).await.unwrap();
        assert_eq!(replay.len(), 3);
        let replayed: Vec<MessageId> = replay.map(|m| m.id).collect();
        assert_eq!(replayed, ids);
    }

    pub async fn duplicate_payload_is_stored_once(store: &dyn MessageStore) {
        let topic = key("dupes");
        let first = put(store, &topic, b"same bytes").await;
        let second = put(store, &topic, b"same bytes").await;
        assert_eq!(first, second);

        let messages: Vec<StoredMessage> =
            store.get_messages("bob", &topic).await.unwrap().collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"same bytes");
        assert_eq!(messages[0].subscription, topic);
        assert_eq!(store.message_count().await.unwrap(), 1);
    }

    pub async fn read_messages_are_not_replayed(store: &dyn MessageStore) {
        let topic = key("reads");
        let one = put(store, &topic, b"one").await;
        let two = put(store, &topic, b"two").await;
        let three = put(store, &topic, b"three").await;

        store.mark_read(&two, "carol").await.unwrap();
        store.mark_read(&two, "carol").await.unwrap();

        let unread: Vec<MessageId> = store
            .get_messages("carol", &topic)
            .await
            .unwrap()
            .map(|m| m.id)
            .collect();
        assert_eq!(unread, vec![one.clone(), three.clone()]);

        // Markers are per user.
        let other: Vec<MessageId> = store
            .get_messages("dave", &topic)
            .await
            .unwrap()
            .map(|m| m.id)
            .collect();
        assert_eq!(other, vec![one, two, three]);
    }

    pub async fn mark_read_unknown_is_not_found(store: &dyn MessageStore) {
        let topic = key("unknown");
        put(store, &topic, b"kept").await;

        let missing = MessageId::for_payload(b"never stored");
        let err = store.mark_read(&missing, "erin").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));

        let unread = store.get_messages("erin", &topic).await.unwrap();
        assert_eq!(unread.len(), 1);
    }

    pub async fn same_message_on_two_topics(store: &dyn MessageStore) {
        let a = key("left");
        let b = key("right");
        let id = put(store, &a, b"shared").await;
        put(store, &b, b"shared").await;

        store.mark_read(&id, "frank").await.unwrap();
        assert_eq!(store.get_messages("frank", &a).await.unwrap().len(), 0);
        assert_eq!(store.get_messages("frank", &b).await.unwrap().len(), 0);
        assert_eq!(store.get_messages("grace", &b).await.unwrap().len(), 1);
    }

    pub async fn replay_is_a_snapshot(store: &dyn MessageStore) {
        let topic = key("snapshot");
        put(store, &topic, b"before").await;

        let replay = store.get_messages("heidi", &topic).await.unwrap();
        put(store, &topic, b"after").await;

        assert_eq!(replay.count(), 1);
    }

    pub async fn empty_topic_replays_nothing(store: &dyn MessageStore) {
        let replay = store.get_messages("ivan", &key("nothing")).await.unwrap();
        assert_eq!(replay.len(), 0);
    }
}
