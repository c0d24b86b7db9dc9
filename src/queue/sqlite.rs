//! SQLite-backed [`MessageQueue`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{MessageQueue, QueueError, QueueMessage};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS nft_block_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL UNIQUE,
        body TEXT NOT NULL,
        receipt TEXT,
        visible_at INTEGER NOT NULL,
        receive_count INTEGER NOT NULL DEFAULT 0,
        enqueued_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_nft_block_queue_visible ON nft_block_queue(visible_at, seq);
";

pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    pub fn open(path: impl AsRef<Path>, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open(path.as_ref()).map_err(backend)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(backend)?;

        let queue = Self::with_connection(conn, visibility_timeout)?;
        tracing::info!(
            target: "nftwatch::queue",
            db_path = %path.as_ref().display(),
            visibility_timeout_secs = visibility_timeout.as_secs(),
            "Block queue initialized"
        );
        Ok(queue)
    }

    pub fn in_memory(visibility_timeout: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(conn, visibility_timeout)
    }

    fn with_connection(conn: Connection, visibility_timeout: Duration) -> Result<Self, QueueError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            visibility_timeout,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Backend("connection mutex poisoned".to_string()))
    }

    /// Messages still in the queue, visible or not.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM nft_block_queue", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

fn backend(err: rusqlite::Error) -> QueueError {
    QueueError::Backend(err.to_string())
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let hidden_until = now + self.visibility_timeout.as_millis() as i64;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(backend)?;

        let visible: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT message_id, body FROM nft_block_queue
                     WHERE visible_at <= ?1
                     ORDER BY seq
                     LIMIT ?2",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![now, max as i64], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(backend)?;
            rows.collect::<Result<_, _>>().map_err(backend)?
        };

        let mut messages = Vec::with_capacity(visible.len());
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE nft_block_queue
                     SET receipt = ?1, visible_at = ?2, receive_count = receive_count + 1
                     WHERE message_id = ?3",
                )
                .map_err(backend)?;
            for (message_id, body) in visible {
                let receipt = Uuid::new_v4().to_string();
                stmt.execute(params![receipt, hidden_until, message_id])
                    .map_err(backend)?;
                messages.push(QueueMessage {
                    message_id,
                    receipt,
                    body,
                });
            }
        }
        tx.commit().map_err(backend)?;

        if !messages.is_empty() {
            tracing::debug!(target: "nftwatch::queue", count = messages.len(), "Received messages");
        }
        Ok(messages)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM nft_block_queue WHERE message_id = ?1 AND receipt = ?2",
                params![message.message_id, message.receipt],
            )
            .map_err(backend)?;

        if deleted == 0 {
            // The visibility timeout lapsed and another receiver holds a newer receipt.
            tracing::warn!(
                target: "nftwatch::queue",
                message_id = %message.message_id,
                "Delete ignored, receipt is no longer current"
            );
        }
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO nft_block_queue (message_id, body, visible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, body, Utc::now().timestamp_millis(), Utc::now().to_rfc3339()],
        )
        .map_err(backend)?;
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BlockMessage;

    #[tokio::test]
    async fn test_send_receive_delete() {
        let queue = SqliteQueue::in_memory(DEFAULT_VISIBILITY_TIMEOUT).unwrap();
        let first = queue.send(&BlockMessage { block_num: 1 }.to_body()).await.unwrap();
        let second = queue.send(&BlockMessage { block_num: 2 }.to_body()).await.unwrap();

        let messages = queue.receive(10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, first);
        assert_eq!(messages[1].message_id, second);
        assert_eq!(BlockMessage::parse(&messages[1].body).unwrap().block_num, 2);

        for message in &messages {
            queue.delete(message).await.unwrap();
        }
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_received_messages_are_hidden() {
        let queue = SqliteQueue::in_memory(DEFAULT_VISIBILITY_TIMEOUT).unwrap();
        for block_num in 0..3 {
            queue.send(&BlockMessage { block_num }.to_body()).await.unwrap();
        }

        assert_eq!(queue.receive(2).await.unwrap().len(), 2);
        let rest = queue.receive(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(BlockMessage::parse(&rest[0].body).unwrap().block_num, 2);
        assert!(queue.receive(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undeleted_message_is_redelivered() {
        let queue = SqliteQueue::in_memory(Duration::ZERO).unwrap();
        let id = queue.send(r#"{"blockNum":5}"#).await.unwrap();

        let first = queue.receive(1).await.unwrap();
        let second = queue.receive(1).await.unwrap();
        assert_eq!(first[0].message_id, id);
        assert_eq!(second[0].message_id, id);
        assert_ne!(first[0].receipt, second[0].receipt);

        // The stale receipt no longer deletes the message.
        queue.delete(&first[0]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        queue.delete(&second[0]).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_on_disk_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let queue = SqliteQueue::open(&path, DEFAULT_VISIBILITY_TIMEOUT).unwrap();
            queue.send(r#"{"blockNum":9}"#).await.unwrap();
        }

        let reopened = SqliteQueue::open(&path, DEFAULT_VISIBILITY_TIMEOUT).unwrap();
        let messages = reopened.receive(1).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, r#"{"blockNum":9}"#);
    }
}
