//! Per-symbol message queues shared with the matching engine
//!
//! Queues are named FIFO lists with head pop and no acknowledgement: a
//! popped message is gone.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;

use crate::error::Result;

/// Well-known queue names
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    /// Order descriptors consumed by the matching engine
    NewOrder(String),
    /// Trade results produced by the matching engine
    TradeResult(String),
    /// Settled trades for the quote/kline consumer
    QuoteTradeResult(String),
    /// Trade results whose settlement stalled on a dependency
    Stalled(String),
}

impl QueueKey {
    pub fn symbol(&self) -> &str {
        match self {
            QueueKey::NewOrder(s)
            | QueueKey::TradeResult(s)
            | QueueKey::QuoteTradeResult(s)
            | QueueKey::Stalled(s) => s,
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKey::NewOrder(s) => write!(f, "match.order.{}", s),
            QueueKey::TradeResult(s) => write!(f, "match.result.{}", s),
            QueueKey::QuoteTradeResult(s) => write!(f, "quote.result.{}", s),
            QueueKey::Stalled(s) => write!(f, "settle.stalled.{}", s),
        }
    }
}

/// Message queue interface
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Number of messages waiting, without blocking
    async fn len(&self, key: &QueueKey) -> Result<u64>;

    /// Remove and return the head message, if any
    async fn pop(&self, key: &QueueKey) -> Result<Option<Vec<u8>>>;

    /// Append a message at the tail
    async fn push(&self, key: &QueueKey, payload: Vec<u8>) -> Result<()>;
}

/// In-memory queues
#[derive(Default)]
pub struct InMemoryMessageQueue {
    queues: DashMap<String, VecDeque<Vec<u8>>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every message currently queued under `key`
    pub fn snapshot(&self, key: &QueueKey) -> Vec<Vec<u8>> {
        self.queues
            .get(&key.to_string())
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn len(&self, key: &QueueKey) -> Result<u64> {
        Ok(self.queues.get(&key.to_string()).map_or(0, |q| q.len() as u64))
    }

    async fn pop(&self, key: &QueueKey) -> Result<Option<Vec<u8>>> {
        Ok(self
            .queues
            .get_mut(&key.to_string())
            .and_then(|mut q| q.pop_front()))
    }

    async fn push(&self, key: &QueueKey, payload: Vec<u8>) -> Result<()> {
        self.queues.entry(key.to_string()).or_default().push_back(payload);
        Ok(())
    }
}

/// Queues stored in the queue_messages table
pub struct PostgresMessageQueue {
    pool: PgPool,
}

impl PostgresMessageQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageQueue for PostgresMessageQueue {
    async fn len(&self, key: &QueueKey) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = $1")
            .bind(key.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn pop(&self, key: &QueueKey) -> Result<Option<Vec<u8>>> {
        // SKIP LOCKED keeps two poppers from handing out the same row
        let payload: Option<Vec<u8>> = sqlx::query_scalar(
            "DELETE FROM queue_messages
             WHERE id = (
                 SELECT id FROM queue_messages
                 WHERE queue = $1
                 ORDER BY id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING payload",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(payload)
    }

    async fn push(&self, key: &QueueKey, payload: Vec<u8>) -> Result<()> {
        sqlx::query("INSERT INTO queue_messages (queue, payload) VALUES ($1, $2)")
            .bind(key.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_queue_is_fifo() {
        let queue = InMemoryMessageQueue::new();
        let key = QueueKey::TradeResult("usdjpy".into());
        queue.push(&key, b"1".to_vec()).await.unwrap();
        queue.push(&key, b"2".to_vec()).await.unwrap();

        assert_eq!(queue.len(&key).await.unwrap(), 2);
        assert_eq!(queue.pop(&key).await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(queue.pop(&key).await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(queue.pop(&key).await.unwrap(), None);
    }

    #[test]
    fn keys_are_namespaced_by_symbol() {
        assert_eq!(QueueKey::NewOrder("usdjpy".into()).to_string(), "match.order.usdjpy");
        assert_eq!(QueueKey::Stalled("usdjpy".into()).symbol(), "usdjpy");
    }
}
