//! SQLite message store.

use super::{MessageStore, Replay, StoredMessage};
use crate::error::StorageError;
use async_trait::async_trait;
use relay_types::{MessageId, SubscriptionKey};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-based message store.
///
/// Uses WAL mode for concurrent reads/writes. The subscription index uses an
/// autoincrement sequence so replay order is insertion order.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;

        let options = SqliteConnectOptions::from_str(path_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                key TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                subscription TEXT NOT NULL,
                payload BLOB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS subscription_index (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                subscription TEXT NOT NULL,
                message_id TEXT NOT NULL,
                UNIQUE(subscription, message_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS read_markers (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                read_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (message_id, user_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_index_subscription_seq ON subscription_index(subscription, seq)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn add_subscription(&self, key: &SubscriptionKey) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO subscriptions (key) VALUES (?1) ON CONFLICT(key) DO NOTHING")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionKey>, StorageError> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM subscriptions ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        keys.iter()
            .map(|k| {
                SubscriptionKey::parse(k).map_err(|e| StorageError::Corrupt {
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn put_message(
        &self,
        key: &SubscriptionKey,
        id: &MessageId,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        // Content-addressed: a rewrite carries identical bytes.
        sqlx::query(
            r#"
            INSERT INTO messages (id, subscription, payload)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(id.as_str())
        .bind(key.as_str())
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_index (subscription, message_id)
            VALUES (?1, ?2)
            ON CONFLICT(subscription, message_id) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_messages(
        &self,
        user_id: &str,
        key: &SubscriptionKey,
    ) -> Result<Replay, StorageError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT m.id, m.payload
            FROM subscription_index i
            JOIN messages m ON m.id = i.message_id
            WHERE i.subscription = ?1
              AND NOT EXISTS (
                  SELECT 1 FROM read_markers r
                  WHERE r.message_id = i.message_id AND r.user_id = ?2
              )
            ORDER BY i.seq ASC
            "#,
        )
        .bind(key.as_str())
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|row| row.into_stored(key))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Replay::new(messages))
    }

    async fn mark_read(&self, id: &MessageId, user_id: &str) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM messages WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StorageError::NotFound {
                message_id: id.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO read_markers (message_id, user_id)
            VALUES (?1, ?2)
            ON CONFLICT(message_id, user_id) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn message_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn subscription_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Internal row type for replay queries.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    payload: Vec<u8>,
}

impl MessageRow {
    fn into_stored(self, key: &SubscriptionKey) -> Result<StoredMessage, StorageError> {
        let id = MessageId::parse(&self.id).map_err(|e| {
            tracing::error!("Corrupt message id in store: {}", self.id);
            StorageError::Corrupt {
                reason: e.to_string(),
            }
        })?;
        Ok(StoredMessage {
            id,
            subscription: key.clone(),
            payload: self.payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::contract;

    #[tokio::test]
    async fn subscriptions_are_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::subscriptions_are_idempotent(&store).await;
    }

    #[tokio::test]
    async fn replay_is_in_insertion_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::replay_is_in_insertion_order(&store).await;
    }

    #[tokio::test]
    async fn duplicate_payload_is_stored_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::duplicate_payload_is_stored_once(&store).await;
    }

    #[tokio::test]
    async fn read_messages_are_not_replayed() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::read_messages_are_not_replayed(&store).await;
    }

    #[tokio::test]
    async fn mark_read_unknown_is_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::mark_read_unknown_is_not_found(&store).await;
    }

    #[tokio::test]
    async fn same_message_on_two_topics() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::same_message_on_two_topics(&store).await;
    }

    #[tokio::test]
    async fn replay_is_a_snapshot() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::replay_is_a_snapshot(&store).await;
    }

    #[tokio::test]
    async fn empty_topic_replays_nothing() {
        let store = SqliteStore::in_memory().await.unwrap();
        contract::empty_topic_replays_nothing(&store).await;
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let topic = contract::key("durable");
        let id = MessageId::for_payload(b"persisted");

        {
            let store = SqliteStore::new(&path).await.unwrap();
            store.add_subscription(&topic).await.unwrap();
            store.put_message(&topic, &id, b"persisted").await.unwrap();
            store.mark_read(&id, "judy").await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.list_subscriptions().await.unwrap(), vec![topic.clone()]);
        assert_eq!(store.get_messages("judy", &topic).await.unwrap().len(), 0);

        let replay: Vec<StoredMessage> =
            store.get_messages("mallory", &topic).await.unwrap().collect();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].id, id);
        assert_eq!(replay[0].payload, b"persisted");
    }

    #[tokio::test]
    async fn concurrent_puts_keep_every_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&dir.path().join("relay.db")).await.unwrap();
        let topic = contract::key("busy");

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let topic = topic.clone();
            handles.push(tokio::spawn(async move {
                let payload = format!("message-{i}").into_bytes();
                let id = MessageId::for_payload(&payload);
                store.put_message(&topic, &id, &payload).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_messages("oscar", &topic).await.unwrap().len(), 20);
        assert_eq!(store.message_count().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn unusable_path_is_an_error() {
        let result = SqliteStore::new(Path::new("/nonexistent/dir/relay.db")).await;
        assert!(result.is_err());
    }
}
