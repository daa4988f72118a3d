//! Shared key/value store boundary.
//!
//! Redis-shaped contract used by the DLQ store and as the lock manager's
//! cross-process replica: string keys with TTL plus score-ordered sets.
//! The in-memory implementation is the default; a networked adapter can
//! implement the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::time::{SystemWallClock, WallClock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Add or update a member of a score-ordered set.
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError>;
    async fn zrem(&self, set: &str, member: &str) -> Result<bool, StoreError>;
    async fn zcard(&self, set: &str) -> Result<u64, StoreError>;
    /// Members with score <= `max_score`, ascending, at most `limit`.
    async fn zrange_by_score(
        &self,
        set: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
    /// All members ascending by score, at most `limit`.
    async fn zrange(&self, set: &str, limit: usize) -> Result<Vec<String>, StoreError>;
    /// Names of ordered sets starting with `prefix`.
    async fn zset_names(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// TTL-aware in-memory implementation of [`KeyValueStore`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    zsets: RwLock<HashMap<String, HashMap<String, f64>>>,
    clock: Arc<dyn WallClock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemWallClock))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn WallClock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            zsets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn live(&self, entry: &Entry) -> bool {
        entry.expires_at.map_or(true, |at| at > self.clock.now_utc())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).filter(|e| self.live(e)).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| {
            self.clock.now_utc() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
        });
        self.entries.write().await.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.zsets
            .write()
            .await
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        let mut zsets = self.zsets.write().await;
        let removed = zsets.get_mut(set).map_or(false, |m| m.remove(member).is_some());
        if zsets.get(set).is_some_and(|m| m.is_empty()) {
            zsets.remove(set);
        }
        Ok(removed)
    }

    async fn zcard(&self, set: &str) -> Result<u64, StoreError> {
        Ok(self.zsets.read().await.get(set).map_or(0, |m| m.len() as u64))
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let zsets = self.zsets.read().await;
        let mut members: Vec<(String, f64)> = zsets
            .get(set)
            .map(|m| {
                m.iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members.into_iter().take(limit).map(|(member, _)| member).collect())
    }

    async fn zrange(&self, set: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.zrange_by_score(set, f64::INFINITY, limit).await
    }

    async fn zset_names(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .zsets
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}
