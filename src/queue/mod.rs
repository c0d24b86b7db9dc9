//! Block notification queue.
//!
//! Producers enqueue `{ "blockNum": n }` bodies; the consumer receives them with
//! a visibility timeout and deletes each one once its outcome is recorded. A
//! message that is received but never deleted becomes visible again.

pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// A received message. `receipt` identifies this particular delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt: String,
    pub body: String,
}

/// Body of a block notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMessage {
    pub block_num: u64,
}

impl BlockMessage {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    pub fn to_body(self) -> String {
        format!("{{\"blockNum\":{}}}", self.block_num)
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Up to `max` currently visible messages. Each returned message stays
    /// hidden from other receivers until its visibility timeout lapses.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError>;

    /// Removes a received message for good.
    async fn delete(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Enqueues a body and returns its message id.
    async fn send(&self, body: &str) -> Result<String, QueueError>;
}
