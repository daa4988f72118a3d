//! Durable DLQ storage over the shared key/value store.
//!
//! Key layout:
//! - `{prefix}:{queue}:{id}` — serialized message, expires with the queue TTL
//! - `{prefix}:index:{queue}` — ordered set scored by next-retry epoch seconds
//! - `poison:{queue}:{id}` — poisoned message, no expiry
//! - `poison:index:{queue}` — ordered set scored by promotion time

use super::message::{DlqMessage, DlqReason, MessageStatus};
use crate::store::{KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const POISON_PREFIX: &str = "poison";

/// Index scores are fractional epoch seconds so sub-second retry delays
/// keep their ordering.
fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("no handler registered for queue {0}")]
    NoHandler(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-queue size summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub size: u64,
    pub poison_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DlqStats {
    pub queues: HashMap<String, QueueStats>,
    pub total_messages: u64,
    pub total_poison_messages: u64,
}

/// Message persistence for one DLQ deployment (all queues share a prefix).
#[derive(Debug, Clone)]
pub struct DlqStore {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    ttl: Duration,
}

impl DlqStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self { store, key_prefix: key_prefix.into(), ttl }
    }

    fn message_key(&self, queue: &str, id: &str) -> String {
        format!("{}:{queue}:{id}", self.key_prefix)
    }

    fn index_key(&self, queue: &str) -> String {
        format!("{}:index:{queue}", self.key_prefix)
    }

    fn poison_key(queue: &str, id: &str) -> String {
        format!("{POISON_PREFIX}:{queue}:{id}")
    }

    fn poison_index_key(queue: &str) -> String {
        format!("{POISON_PREFIX}:index:{queue}")
    }

    /// Persist a message and index it by its next retry time.
    pub async fn put(&self, message: &DlqMessage) -> Result<(), DlqError> {
        let serialized = serde_json::to_string(message)?;
        self.store
            .set(
                &self.message_key(&message.queue_name, &message.message_id),
                serialized,
                Some(self.ttl),
            )
            .await?;
        let score =
            epoch_seconds(message.next_retry_time.unwrap_or(message.last_failure_time));
        self.store
            .zadd(&self.index_key(&message.queue_name), &message.message_id, score)
            .await?;
        Ok(())
    }

    pub async fn get(&self, queue: &str, id: &str) -> Result<Option<DlqMessage>, DlqError> {
        match self.store.get(&self.message_key(queue, id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Messages whose next retry time has arrived, oldest first.
    pub async fn list_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DlqMessage>, DlqError> {
        let ids = self
            .store
            .zrange_by_score(&self.index_key(queue), epoch_seconds(now), limit)
            .await?;
        self.load_many(queue, ids).await
    }

    pub async fn list_all(&self, queue: &str, limit: usize) -> Result<Vec<DlqMessage>, DlqError> {
        let ids = self.store.zrange(&self.index_key(queue), limit).await?;
        self.load_many(queue, ids).await
    }

    /// Remove a message from the live queue and its index.
    pub async fn delete(&self, queue: &str, id: &str) -> Result<bool, DlqError> {
        let existed = self.store.delete(&self.message_key(queue, id)).await?;
        self.store.zrem(&self.index_key(queue), id).await?;
        Ok(existed)
    }

    /// Copy a message into the poison queue (no expiry) and mark it poison.
    /// The live record is untouched; callers delete it separately.
    pub async fn promote_poison(
        &self,
        message: &mut DlqMessage,
        now: DateTime<Utc>,
    ) -> Result<(), DlqError> {
        message.reason = DlqReason::PoisonMessage;
        message.status = MessageStatus::Poison;
        let serialized = serde_json::to_string(message)?;
        self.store
            .set(
                &Self::poison_key(&message.queue_name, &message.message_id),
                serialized,
                None,
            )
            .await?;
        self.store
            .zadd(
                &Self::poison_index_key(&message.queue_name),
                &message.message_id,
                epoch_seconds(now),
            )
            .await?;
        Ok(())
    }

    pub async fn queue_size(&self, queue: &str) -> Result<u64, DlqError> {
        Ok(self.store.zcard(&self.index_key(queue)).await?)
    }

    pub async fn poison_count(&self, queue: &str) -> Result<u64, DlqError> {
        Ok(self.store.zcard(&Self::poison_index_key(queue)).await?)
    }

    pub async fn poison_ids(&self, queue: &str, limit: usize) -> Result<Vec<String>, DlqError> {
        Ok(self.store.zrange(&Self::poison_index_key(queue), limit).await?)
    }

    pub async fn stats(&self) -> Result<DlqStats, DlqError> {
        let index_prefix = format!("{}:index:", self.key_prefix);
        let mut stats = DlqStats::default();
        for name in self.store.zset_names(&index_prefix).await? {
            let queue = name.trim_start_matches(&index_prefix).to_string();
            let size = self.store.zcard(&name).await?;
            let poison_size = self.poison_count(&queue).await?;
            stats.total_messages += size;
            stats.total_poison_messages += poison_size;
            stats.queues.insert(queue, QueueStats { size, poison_size });
        }
        Ok(stats)
    }

    async fn load_many(
        &self,
        queue: &str,
        ids: Vec<String>,
    ) -> Result<Vec<DlqMessage>, DlqError> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get(&self.message_key(queue, &id)).await? {
                Some(raw) => match serde_json::from_str(&raw) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => {
                        tracing::error!(queue, id, error = %e, "corrupt DLQ record skipped");
                    }
                },
                // Expired value with a live index entry; drop the index row.
                None => {
                    self.store.zrem(&self.index_key(queue), &id).await?;
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::time::{ManualWallClock, WallClock};
    use serde_json::json;

    fn message(clock: &ManualWallClock, id: &str, next_retry_in: Option<i64>) -> DlqMessage {
        let now = clock.now_utc();
        DlqMessage {
            message_id: id.to_string(),
            queue_name: "orders".into(),
            original_message: json!({"n": 1}),
            reason: DlqReason::NetworkError,
            error_details: "net down".into(),
            retry_count: 0,
            max_retries: 3,
            first_failure_time: now,
            last_failure_time: now,
            next_retry_time: next_retry_in.map(|s| now + chrono::Duration::seconds(s)),
            status: MessageStatus::Pending,
            metadata: Default::default(),
            error_history: Vec::new(),
        }
    }

    fn store(clock: &ManualWallClock) -> DlqStore {
        DlqStore::new(
            Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))),
            "dlq",
            Duration::from_secs(86_400),
        )
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let clock = ManualWallClock::new();
        let store = store(&clock);
        let msg = message(&clock, "m1", Some(60));
        store.put(&msg).await.unwrap();

        assert_eq!(store.get("orders", "m1").await.unwrap().unwrap(), msg);
        assert_eq!(store.queue_size("orders").await.unwrap(), 1);

        assert!(store.delete("orders", "m1").await.unwrap());
        assert!(store.get("orders", "m1").await.unwrap().is_none());
        assert_eq!(store.queue_size("orders").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_ready_honors_next_retry_time() {
        let clock = ManualWallClock::new();
        let store = store(&clock);
        store.put(&message(&clock, "due", Some(10))).await.unwrap();
        store.put(&message(&clock, "later", Some(600))).await.unwrap();

        clock.advance(Duration::from_secs(30));
        let ready = store.list_ready("orders", clock.now_utc(), 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "due");
    }

    #[tokio::test]
    async fn promote_poison_moves_to_poison_index() {
        let clock = ManualWallClock::new();
        let store = store(&clock);
        let mut msg = message(&clock, "bad", Some(0));
        store.put(&msg).await.unwrap();

        store.promote_poison(&mut msg, clock.now_utc()).await.unwrap();
        store.delete("orders", "bad").await.unwrap();

        assert_eq!(msg.status, MessageStatus::Poison);
        assert_eq!(msg.reason, DlqReason::PoisonMessage);
        assert_eq!(store.poison_count("orders").await.unwrap(), 1);
        assert_eq!(store.queue_size("orders").await.unwrap(), 0);
        assert_eq!(store.poison_ids("orders", 10).await.unwrap(), vec!["bad"]);
    }

    #[tokio::test]
    async fn stats_aggregate_across_queues() {
        let clock = ManualWallClock::new();
        let store = store(&clock);
        store.put(&message(&clock, "a", Some(0))).await.unwrap();
        let mut other = message(&clock, "b", Some(0));
        other.queue_name = "webhooks".into();
        store.put(&other).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.queues["orders"].size, 1);
        assert_eq!(stats.queues["webhooks"].size, 1);
    }

    #[tokio::test]
    async fn dangling_index_entries_are_pruned() {
        let clock = ManualWallClock::new();
        let store = store(&clock);
        let msg = message(&clock, "ttl", Some(0));
        store.put(&msg).await.unwrap();

        // Value expires, index entry remains until the next listing.
        clock.advance(Duration::from_secs(90_000));
        let ready = store.list_ready("orders", clock.now_utc(), 10).await.unwrap();
        assert!(ready.is_empty());
        assert_eq!(store.queue_size("orders").await.unwrap(), 0);
    }
}
