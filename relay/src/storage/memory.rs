//! In-memory message store.

use super::{MessageStore, Replay, StoredMessage};
use crate::error::StorageError;
use async_trait::async_trait;
use relay_types::{MessageId, SubscriptionKey};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Mutex;

/// Insertion-ordered set with constant-time membership.
struct OrderedSet<T> {
    order: Vec<T>,
    members: HashSet<T>,
}

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            members: HashSet::new(),
        }
    }
}

impl<T: Eq + Hash + Clone> OrderedSet<T> {
    /// Append `item` unless present. Returns whether it was added.
    fn insert(&mut self, item: &T) -> bool {
        if !self.members.insert(item.clone()) {
            return false;
        }
        self.order.push(item.clone());
        true
    }

    fn iter(&self) -> std::slice::Iter<'_, T> {
        self.order.iter()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Default)]
struct Inner {
    subscriptions: OrderedSet<SubscriptionKey>,
    messages: HashMap<MessageId, Vec<u8>>,
    index: HashMap<SubscriptionKey, OrderedSet<MessageId>>,
    // Reader -> ids it has acknowledged.
    read: HashMap<String, HashSet<MessageId>>,
}

/// Message store held in process memory. Contents are lost on restart.
///
/// One mutex guards every map; it is never held across an await.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Corrupt {
            reason: "memory store lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn add_subscription(&self, key: &SubscriptionKey) -> Result<(), StorageError> {
        self.lock()?.subscriptions.insert(key);
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionKey>, StorageError> {
        Ok(self.lock()?.subscriptions.iter().cloned().collect())
    }

    async fn put_message(
        &self,
        key: &SubscriptionKey,
        id: &MessageId,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.messages.insert(id.clone(), payload.to_vec());
        inner.index.entry(key.clone()).or_default().insert(id);
        Ok(())
    }

    async fn get_messages(
        &self,
        user_id: &str,
        key: &SubscriptionKey,
    ) -> Result<Replay, StorageError> {
        let inner = self.lock()?;
        let Some(ids) = inner.index.get(key) else {
            return Ok(Replay::empty());
        };

        let read = inner.read.get(user_id);
        let mut messages = Vec::new();
        for id in ids.iter() {
            if read.is_some_and(|read| read.contains(id)) {
                continue;
            }
            let payload = inner.messages.get(id).ok_or_else(|| StorageError::Corrupt {
                reason: format!("indexed message {id} has no payload"),
            })?;
            messages.push(StoredMessage {
                id: id.clone(),
                subscription: key.clone(),
                payload: payload.clone(),
            });
        }
        Ok(Replay::new(messages))
    }

    async fn mark_read(&self, id: &MessageId, user_id: &str) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        if !inner.messages.contains_key(id) {
            return Err(StorageError::NotFound {
                message_id: id.to_string(),
            });
        }
        inner
            .read
            .entry(user_id.to_string())
            .or_default()
            .insert(id.clone());
        Ok(())
    }

    async fn message_count(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.messages.len() as u64)
    }

    async fn subscription_count(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.subscriptions.len() as u64)
    }
}
