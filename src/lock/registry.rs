//! Lock registry: authoritative in-process table with a best-effort
//! distributed replica for cross-process visibility.

use super::types::BranchLock;
use crate::store::KeyValueStore;
use crate::time::{SystemWallClock, WallClock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

const CACHE_PREFIX: &str = "branch_lock";

#[derive(Debug)]
pub struct LockRegistry {
    locks: RwLock<HashMap<Uuid, BranchLock>>,
    replica: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn WallClock>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LockRegistry {
    pub fn new(replica: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self { locks: RwLock::new(HashMap::new()), replica, clock: Arc::new(SystemWallClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn insert(&self, lock: BranchLock) {
        self.locks.write().await.insert(lock.id, lock.clone());
        self.replicate(&lock).await;
    }

    pub async fn get(&self, id: Uuid) -> Option<BranchLock> {
        self.locks.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: Uuid) -> Option<BranchLock> {
        let removed = self.locks.write().await.remove(&id);
        if removed.is_some() {
            if let Some(replica) = &self.replica {
                if let Err(e) = replica.delete(&format!("{CACHE_PREFIX}:{id}")).await {
                    tracing::warn!(lock_id = %id, error = %e, "lock replica delete failed");
                }
            }
        }
        removed
    }

    /// Active locks, optionally narrowed to one branch.
    pub async fn list(&self, branch: Option<&str>) -> Vec<BranchLock> {
        self.locks
            .read()
            .await
            .values()
            .filter(|lock| branch.map_or(true, |b| lock.branch_name == b))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }

    /// Write-through copy keyed `branch_lock:{id}` with TTL equal to the
    /// lock's remaining lifetime. Failures degrade to in-memory only.
    async fn replicate(&self, lock: &BranchLock) {
        let Some(replica) = &self.replica else { return };
        let serialized = match serde_json::to_string(lock) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(lock_id = %lock.id, error = %e, "lock serialization failed");
                return;
            }
        };
        let remaining = (lock.expires_at - self.clock.now_utc())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        if let Err(e) = replica
            .set(&format!("{CACHE_PREFIX}:{}", lock.id), serialized, Some(remaining))
            .await
        {
            tracing::warn!(lock_id = %lock.id, error = %e, "lock replica write failed, in-memory copy remains authoritative");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::types::{LockScope, LockType};
    use crate::store::{MemoryStore, StoreError};
    use crate::time::ManualWallClock;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    fn lock(clock: &ManualWallClock, branch: &str) -> BranchLock {
        let now = clock.now_utc();
        BranchLock {
            id: Uuid::new_v4(),
            branch_name: branch.into(),
            lock_type: LockType::Maintenance,
            lock_scope: LockScope::Branch,
            resource_type: None,
            resource_id: None,
            locked_by: "ops".into(),
            acquired_at: now,
            expires_at: now + ChronoDuration::hours(1),
            reason: "maintenance".into(),
            heartbeat_interval_s: 0,
            last_heartbeat: None,
            heartbeat_source: None,
            auto_release_enabled: true,
            is_active: true,
            released_at: None,
            released_by: None,
        }
    }

    #[tokio::test]
    async fn insert_get_remove_round_trip() {
        let clock = ManualWallClock::new();
        let registry = LockRegistry::new(None).with_clock(Arc::new(clock.clone()));
        let l = lock(&clock, "prod/api/main");
        registry.insert(l.clone()).await;

        assert_eq!(registry.get(l.id).await.unwrap(), l);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.remove(l.id).await.unwrap().id, l.id);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn list_filters_by_branch() {
        let clock = ManualWallClock::new();
        let registry = LockRegistry::new(None).with_clock(Arc::new(clock.clone()));
        registry.insert(lock(&clock, "prod/api/main")).await;
        registry.insert(lock(&clock, "dev/api/main")).await;

        assert_eq!(registry.list(Some("prod/api/main")).await.len(), 1);
        assert_eq!(registry.list(None).await.len(), 2);
    }

    #[tokio::test]
    async fn replica_carries_serialized_lock_with_ttl() {
        let clock = ManualWallClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let registry = LockRegistry::new(Some(store.clone())).with_clock(Arc::new(clock.clone()));
        let l = lock(&clock, "prod/api/main");
        registry.insert(l.clone()).await;

        let raw = store.get(&format!("branch_lock:{}", l.id)).await.unwrap().unwrap();
        let replicated: BranchLock = serde_json::from_str(&raw).unwrap();
        assert_eq!(replicated, l);

        // The replica expires with the lock.
        clock.advance(std::time::Duration::from_secs(3700));
        assert!(store.get(&format!("branch_lock:{}", l.id)).await.unwrap().is_none());
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: String, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn zadd(&self, _: &str, _: &str, _: f64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn zrem(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn zcard(&self, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn zrange_by_score(
            &self,
            _: &str,
            _: f64,
            _: usize,
        ) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn zrange(&self, _: &str, _: usize) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn zset_names(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_replica_degrades_to_memory_only() {
        let clock = ManualWallClock::new();
        let registry =
            LockRegistry::new(Some(Arc::new(BrokenStore))).with_clock(Arc::new(clock.clone()));
        let l = lock(&clock, "prod/api/main");
        registry.insert(l.clone()).await;
        // Operations keep working against the in-memory copy.
        assert!(registry.get(l.id).await.is_some());
        assert!(registry.remove(l.id).await.is_some());
    }
}
