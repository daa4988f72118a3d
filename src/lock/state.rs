//! Branch state manager: the lifecycle state machine plus its persistence.
//!
//! In-memory is authoritative. The shared cache gives fast cross-process
//! reads (`branch_state:{branch}`, TTL one hour) and the durable store is
//! the long-term record; both are best-effort and logged at WARN when
//! unavailable.

use super::types::{
    is_valid_transition, BranchLock, BranchState, BranchStateInfo, BranchStateTransition,
    HeartbeatRecord, LockError,
};
use crate::error::BoxError;
use crate::store::KeyValueStore;
use crate::time::{SystemWallClock, WallClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

const STATE_CACHE_PREFIX: &str = "branch_state";
const STATE_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Durable storage seam for branch state, transitions, and heartbeats.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    async fn store_branch_state(&self, state: &BranchStateInfo) -> Result<(), BoxError>;
    async fn store_state_transition(
        &self,
        transition: &BranchStateTransition,
    ) -> Result<(), BoxError>;
    async fn store_heartbeat_record(&self, record: &HeartbeatRecord) -> Result<(), BoxError>;
    async fn get_branch_state(&self, branch: &str)
        -> Result<Option<BranchStateInfo>, BoxError>;
}

/// In-memory durable store, used in tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, BranchStateInfo>>,
    transitions: RwLock<Vec<BranchStateTransition>>,
    heartbeats: RwLock<Vec<HeartbeatRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transitions(&self) -> Vec<BranchStateTransition> {
        self.transitions.read().await.clone()
    }

    pub async fn heartbeats(&self) -> Vec<HeartbeatRecord> {
        self.heartbeats.read().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn store_branch_state(&self, state: &BranchStateInfo) -> Result<(), BoxError> {
        self.states.write().await.insert(state.branch_name.clone(), state.clone());
        Ok(())
    }

    async fn store_state_transition(
        &self,
        transition: &BranchStateTransition,
    ) -> Result<(), BoxError> {
        self.transitions.write().await.push(transition.clone());
        Ok(())
    }

    async fn store_heartbeat_record(&self, record: &HeartbeatRecord) -> Result<(), BoxError> {
        self.heartbeats.write().await.push(record.clone());
        Ok(())
    }

    async fn get_branch_state(
        &self,
        branch: &str,
    ) -> Result<Option<BranchStateInfo>, BoxError> {
        Ok(self.states.read().await.get(branch).cloned())
    }
}

#[derive(Debug)]
pub struct LockStateManager {
    cache: Option<Arc<dyn KeyValueStore>>,
    store: Option<Arc<dyn StateStore>>,
    states: RwLock<HashMap<String, BranchStateInfo>>,
    clock: Arc<dyn WallClock>,
}

impl Default for LockStateManager {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl LockStateManager {
    pub fn new(cache: Option<Arc<dyn KeyValueStore>>, store: Option<Arc<dyn StateStore>>) -> Self {
        Self { cache, store, states: RwLock::new(HashMap::new()), clock: Arc::new(SystemWallClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Resolve a branch's state: cache, then memory, then durable store,
    /// defaulting new branches to ACTIVE.
    pub async fn get_branch_state(&self, branch: &str) -> BranchStateInfo {
        if let Some(cache) = &self.cache {
            match cache.get(&format!("{STATE_CACHE_PREFIX}:{branch}")).await {
                Ok(Some(raw)) => match serde_json::from_str::<BranchStateInfo>(&raw) {
                    Ok(state) => {
                        self.states.write().await.insert(branch.to_string(), state.clone());
                        return state;
                    }
                    Err(e) => {
                        tracing::warn!(branch, error = %e, "corrupt cached branch state ignored")
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(branch, error = %e, "branch state cache read failed"),
            }
        }

        if let Some(state) = self.states.read().await.get(branch) {
            return state.clone();
        }

        if let Some(store) = &self.store {
            match store.get_branch_state(branch).await {
                Ok(Some(state)) => {
                    self.states.write().await.insert(branch.to_string(), state.clone());
                    self.write_cache(&state).await;
                    return state;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(branch, error = %e, "branch state store read failed"),
            }
        }

        let state = BranchStateInfo::initial(branch, self.clock.now_utc());
        self.persist(&state).await;
        state
    }

    /// Apply a validated transition. Invalid requests fail without any
    /// observable change; same-state requests are a no-op.
    pub async fn transition(
        &self,
        branch: &str,
        to: BranchState,
        changed_by: &str,
        reason: &str,
    ) -> Result<BranchStateInfo, LockError> {
        let mut state = self.get_branch_state(branch).await;
        let from = state.current_state;
        if from == to {
            tracing::debug!(branch, state = to.as_str(), "branch already in requested state");
            return Ok(state);
        }
        if !is_valid_transition(from, to) {
            return Err(LockError::InvalidStateTransition { from, to });
        }

        let now = self.clock.now_utc();
        let transition = BranchStateTransition {
            branch_name: branch.to_string(),
            from_state: from,
            to_state: to,
            transitioned_by: changed_by.to_string(),
            reason: reason.to_string(),
            trigger: "lock_manager".to_string(),
            transitioned_at: now,
        };

        state.previous_state = Some(from);
        state.current_state = to;
        state.state_changed_at = now;
        state.state_changed_by = changed_by.to_string();
        state.state_change_reason = reason.to_string();
        self.persist(&state).await;

        if let Some(store) = &self.store {
            if let Err(e) = store.store_state_transition(&transition).await {
                tracing::warn!(branch, error = %e, "state transition persist failed");
            }
        }

        tracing::info!(
            branch,
            from = from.as_str(),
            to = to.as_str(),
            by = changed_by,
            reason,
            "branch state transition"
        );
        Ok(state)
    }

    pub async fn add_lock(&self, branch: &str, lock: BranchLock) -> BranchStateInfo {
        let mut state = self.get_branch_state(branch).await;
        state.active_locks.push(lock);
        self.persist(&state).await;
        state
    }

    pub async fn remove_lock(&self, branch: &str, lock_id: Uuid) -> BranchStateInfo {
        let mut state = self.get_branch_state(branch).await;
        state.active_locks.retain(|lock| lock.id != lock_id);
        self.persist(&state).await;
        state
    }

    /// Refresh the stored copy of a lock inside the branch state.
    pub async fn update_lock(&self, branch: &str, lock: &BranchLock) -> BranchStateInfo {
        let mut state = self.get_branch_state(branch).await;
        if let Some(existing) = state.active_locks.iter_mut().find(|l| l.id == lock.id) {
            *existing = lock.clone();
        }
        self.persist(&state).await;
        state
    }

    pub async fn update_indexing_metadata(
        &self,
        branch: &str,
        service: &str,
        started: bool,
    ) -> BranchStateInfo {
        let mut state = self.get_branch_state(branch).await;
        let now = self.clock.now_utc();
        if started {
            state.indexing_started_at = Some(now);
            state.indexing_service = Some(service.to_string());
        } else {
            state.indexing_completed_at = Some(now);
        }
        self.persist(&state).await;
        state
    }

    pub async fn record_heartbeat(&self, record: &HeartbeatRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.store_heartbeat_record(record).await {
                tracing::warn!(lock_id = %record.lock_id, error = %e, "heartbeat persist failed");
            }
        }
    }

    async fn persist(&self, state: &BranchStateInfo) {
        self.states.write().await.insert(state.branch_name.clone(), state.clone());
        self.write_cache(state).await;
        if let Some(store) = &self.store {
            if let Err(e) = store.store_branch_state(state).await {
                tracing::warn!(branch = %state.branch_name, error = %e, "branch state persist failed");
            }
        }
    }

    async fn write_cache(&self, state: &BranchStateInfo) {
        let Some(cache) = &self.cache else { return };
        match serde_json::to_string(state) {
            Ok(serialized) => {
                if let Err(e) = cache
                    .set(
                        &format!("{STATE_CACHE_PREFIX}:{}", state.branch_name),
                        serialized,
                        Some(STATE_CACHE_TTL),
                    )
                    .await
                {
                    tracing::warn!(branch = %state.branch_name, error = %e, "branch state cache write failed");
                }
            }
            Err(e) => {
                tracing::warn!(branch = %state.branch_name, error = %e, "branch state serialization failed")
            }
        }
    }
}
