//! Local topic fan-in shared by the network implementations.

use super::TopicStream;
use crate::error::NetworkError;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Buffered payloads per topic before publishers wait.
const TOPIC_BUFFER: usize = 1024;

/// Routes published payloads to the single local subscriber of each topic.
#[derive(Debug, Default)]
pub struct TopicHub {
    topics: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl TopicHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the subscription for `topic`.
    ///
    /// A topic whose previous subscriber has gone away may be subscribed again.
    pub fn subscribe(&self, topic: &str) -> Result<TopicStream, NetworkError> {
        let mut topics = self.topics.lock().map_err(|_| NetworkError::Closed)?;
        if topics.get(topic).is_some_and(|tx| !tx.is_closed()) {
            return Err(NetworkError::Subscribe {
                topic: topic.to_string(),
                reason: "already subscribed".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        topics.insert(topic.to_string(), tx);
        tracing::debug!("Subscribed to topic {}", topic);
        Ok(rx)
    }

    /// Topics with a live subscriber.
    pub fn subscriptions(&self) -> Vec<String> {
        match self.topics.lock() {
            Ok(topics) => topics
                .iter()
                .filter(|(_, tx)| !tx.is_closed())
                .map(|(topic, _)| topic.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Deliver `payload` to the subscriber of `topic`.
    ///
    /// Returns `false` when nobody is subscribed.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        let sender = match self.topics.lock() {
            Ok(topics) => topics.get(topic).cloned(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return false;
        };

        if sender.send(payload).await.is_err() {
            if let Ok(mut topics) = self.topics.lock() {
                if topics.get(topic).is_some_and(|tx| tx.is_closed()) {
                    topics.remove(topic);
                }
            }
            return false;
        }
        true
    }

    /// End the subscription for `topic`; its stream finishes once drained.
    pub fn close(&self, topic: &str) -> bool {
        match self.topics.lock() {
            Ok(mut topics) => topics.remove(topic).is_some(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_payloads_reach_subscriber_in_order() {
        let hub = TopicHub::new();
        let mut rx = hub.subscribe("t").unwrap();

        assert!(hub.publish("t", b"one".to_vec()).await);
        assert!(hub.publish("t", b"two".to_vec()).await);

        assert_eq!(rx.recv().await.unwrap(), b"one");
        assert_eq!(rx.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_dropped() {
        let hub = TopicHub::new();
        assert!(!hub.publish("nobody", b"x".to_vec()).await);
    }

    #[tokio::test]
    async fn second_live_subscription_fails() {
        let hub = TopicHub::new();
        let _rx = hub.subscribe("t").unwrap();
        assert!(matches!(
            hub.subscribe("t"),
            Err(NetworkError::Subscribe { .. })
        ));
        assert_eq!(hub.subscriptions(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn dropped_subscriber_frees_topic() {
        let hub = TopicHub::new();
        let rx = hub.subscribe("t").unwrap();
        drop(rx);

        assert!(hub.subscriptions().is_empty());
        assert!(!hub.publish("t", b"x".to_vec()).await);
        assert!(hub.subscribe("t").is_ok());
    }

    #[tokio::test]
    async fn close_ends_stream() {
        let hub = TopicHub::new();
        let mut rx = hub.subscribe("t").unwrap();
        hub.publish("t", b"last".to_vec()).await;

        assert!(hub.close("t"));
        assert_eq!(rx.recv().await.unwrap(), b"last");
        assert!(rx.recv().await.is_none());
    }
}
