//! Branch lock manager facade.
//!
//! Composes the registry, state manager, heartbeat service, and cleanup
//! sweeper behind the acquire/release/extend contract. Acquire, release,
//! and state transitions are serialized per branch; branches are
//! independent of each other.

use super::cleanup::{CleanupStats, LockCleanupService, LockReleaser};
use super::heartbeat::{HeartbeatService, LockHealth};
use super::registry::LockRegistry;
use super::state::{LockStateManager, StateStore};
use super::types::{
    BranchLock, BranchState, BranchStateInfo, HeartbeatStatus, LockError, LockScope, LockType,
};
use crate::store::KeyValueStore;
use crate::time::{SystemWallClock, WallClock};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Branch names whose final segment is conventionally protected.
pub const PROTECTED_BRANCH_NAMES: [&str; 4] = ["main", "master", "production", "staging"];

/// Policy seam deciding whether a branch may auto-merge once READY.
pub trait AutoMergePolicy: Send + Sync + std::fmt::Debug {
    fn should_auto_merge(&self, branch: &str) -> bool;
}

/// Conservative default: never auto-merge into protected branches.
#[derive(Debug, Default)]
pub struct DenyProtected;

impl AutoMergePolicy for DenyProtected {
    fn should_auto_merge(&self, branch: &str) -> bool {
        let last = branch.rsplit('/').next().unwrap_or(branch);
        !PROTECTED_BRANCH_NAMES.contains(&last)
    }
}

/// Tuning knobs for the facade and its background services.
#[derive(Debug, Clone)]
pub struct LockManagerOptions {
    pub cleanup_interval: std::time::Duration,
    pub cleanup_batch_size: usize,
    pub heartbeat_grace_multiplier: u32,
    /// Per-type TTL overrides; unlisted types use their built-in default.
    pub type_timeouts: HashMap<LockType, ChronoDuration>,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: super::cleanup::DEFAULT_CLEANUP_INTERVAL,
            cleanup_batch_size: super::cleanup::DEFAULT_CLEANUP_BATCH_SIZE,
            heartbeat_grace_multiplier: 3,
            type_timeouts: HashMap::new(),
        }
    }
}

/// Parameters for one lock acquisition.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub branch: String,
    pub lock_type: LockType,
    pub locked_by: String,
    pub lock_scope: LockScope,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub reason: String,
    pub timeout: Option<ChronoDuration>,
    pub enable_heartbeat: bool,
    pub heartbeat_interval_s: u64,
}

impl AcquireRequest {
    pub fn new(
        branch: impl Into<String>,
        lock_type: LockType,
        locked_by: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            lock_type,
            locked_by: locked_by.into(),
            lock_scope: LockScope::Branch,
            resource_type: None,
            resource_id: None,
            reason: "Lock acquired".to_string(),
            timeout: None,
            enable_heartbeat: true,
            heartbeat_interval_s: 60,
        }
    }

    pub fn scope(mut self, scope: LockScope) -> Self {
        self.lock_scope = scope;
        self
    }

    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.lock_scope = LockScope::Resource;
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn timeout(mut self, timeout: ChronoDuration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn heartbeat(mut self, enabled: bool, interval_s: u64) -> Self {
        self.enable_heartbeat = enabled;
        self.heartbeat_interval_s = interval_s;
        self
    }
}

pub struct BranchLockManager {
    registry: Arc<LockRegistry>,
    state: Arc<LockStateManager>,
    heartbeat: Arc<HeartbeatService>,
    cleanup: Arc<LockCleanupService>,
    options: LockManagerOptions,
    auto_merge: Arc<dyn AutoMergePolicy>,
    branch_serial: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    clock: Arc<dyn WallClock>,
    shutdown: watch::Sender<bool>,
    tasks: TokioMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BranchLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchLockManager").field("options", &self.options).finish()
    }
}

impl BranchLockManager {
    pub fn new(
        cache: Option<Arc<dyn KeyValueStore>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        Self::with_options(cache, store, LockManagerOptions::default(), Arc::new(SystemWallClock))
    }

    pub fn with_options(
        cache: Option<Arc<dyn KeyValueStore>>,
        store: Option<Arc<dyn StateStore>>,
        options: LockManagerOptions,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        let registry = Arc::new(LockRegistry::new(cache.clone()).with_clock(clock.clone()));
        let state = Arc::new(LockStateManager::new(cache, store).with_clock(clock.clone()));
        let heartbeat = Arc::new(
            HeartbeatService::new(registry.clone(), state.clone())
                .with_grace_multiplier(options.heartbeat_grace_multiplier)
                .with_clock(clock.clone()),
        );
        let cleanup = Arc::new(
            LockCleanupService::new(
                options.cleanup_interval,
                options.cleanup_batch_size,
                options.heartbeat_grace_multiplier,
            )
            .with_clock(clock.clone()),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            state,
            heartbeat,
            cleanup,
            options,
            auto_merge: Arc::new(DenyProtected),
            branch_serial: StdMutex::new(HashMap::new()),
            clock,
            shutdown,
            tasks: TokioMutex::new(Vec::new()),
        }
    }

    pub fn with_auto_merge_policy(mut self, policy: Arc<dyn AutoMergePolicy>) -> Self {
        self.auto_merge = policy;
        self
    }

    /// Start the periodic cleanup sweeper.
    pub async fn start(self: Arc<Self>) {
        let manager = Arc::clone(&self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.cleanup.cleanup_interval;
        self.tasks.lock().await.push(tokio::spawn(async move {
            tracing::info!("lock cleanup sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.run_cleanup_cycle().await;
                    }
                }
            }
            tracing::info!("lock cleanup sweeper stopped");
        }));
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// One sweep over all active locks, callable directly by tests and
    /// operational tooling.
    pub async fn run_cleanup_cycle(&self) -> usize {
        let releaser = ManagerReleaser(self);
        let locks = self.registry.list(None).await;
        self.cleanup.sweep(locks, &releaser).await.len()
    }

    /// Acquire a lock, or fail with a conflict. No state is changed on
    /// failure.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<Uuid, LockError> {
        match request.lock_scope {
            LockScope::Resource => {
                if request.resource_type.is_none() || request.resource_id.is_none() {
                    return Err(LockError::InvalidScope(
                        "RESOURCE scope requires resource_type and resource_id".into(),
                    ));
                }
            }
            LockScope::ResourceType => {
                if request.resource_type.is_none() {
                    return Err(LockError::InvalidScope(
                        "RESOURCE_TYPE scope requires resource_type".into(),
                    ));
                }
            }
            LockScope::Branch => {}
        }

        let timeout = request
            .timeout
            .or_else(|| self.options.type_timeouts.get(&request.lock_type).copied())
            .unwrap_or_else(|| request.lock_type.default_timeout());
        if timeout <= ChronoDuration::zero() {
            return Err(LockError::InvalidScope("lock timeout must be positive".into()));
        }

        let _serial = self.branch_guard(&request.branch).await;
        let branch_state = self.state.get_branch_state(&request.branch).await;

        let now = self.clock.now_utc();
        let lock = BranchLock {
            id: Uuid::new_v4(),
            branch_name: request.branch.clone(),
            lock_type: request.lock_type,
            lock_scope: request.lock_scope,
            resource_type: request.resource_type.clone(),
            resource_id: request.resource_id.clone(),
            locked_by: request.locked_by.clone(),
            acquired_at: now,
            expires_at: now + timeout,
            reason: request.reason.clone(),
            heartbeat_interval_s: if request.enable_heartbeat {
                request.heartbeat_interval_s
            } else {
                0
            },
            last_heartbeat: request.enable_heartbeat.then_some(now),
            heartbeat_source: request.enable_heartbeat.then(|| request.locked_by.clone()),
            auto_release_enabled: true,
            is_active: true,
            released_at: None,
            released_by: None,
        };

        for existing in branch_state.active_locks.iter().filter(|l| l.is_active) {
            if existing.conflicts_with(&lock) {
                counter!("branch_lock_conflicts_total").increment(1);
                return Err(LockError::Conflict {
                    branch: request.branch.clone(),
                    message: format!(
                        "{} lock request conflicts with existing {} lock {} held by {}",
                        lock.lock_type.as_str(),
                        existing.lock_type.as_str(),
                        existing.id,
                        existing.locked_by
                    ),
                });
            }
        }

        self.registry.insert(lock.clone()).await;
        self.state.add_lock(&request.branch, lock.clone()).await;

        if request.lock_type == LockType::Indexing && request.lock_scope == LockScope::Branch {
            if let Err(e) = self
                .state
                .transition(
                    &request.branch,
                    BranchState::LockedForWrite,
                    &request.locked_by,
                    &format!("Indexing lock acquired: {}", request.reason),
                )
                .await
            {
                // Roll the insert back so a failed acquire leaves no trace.
                self.registry.remove(lock.id).await;
                self.state.remove_lock(&request.branch, lock.id).await;
                return Err(e);
            }
        }

        counter!(
            "branch_locks_acquired_total",
            "lock_type" => request.lock_type.as_str()
        )
        .increment(1);
        tracing::info!(
            lock_id = %lock.id,
            branch = %request.branch,
            lock_type = request.lock_type.as_str(),
            locked_by = %request.locked_by,
            expires_at = %lock.expires_at,
            heartbeat = request.enable_heartbeat,
            "lock acquired"
        );
        Ok(lock.id)
    }

    /// Release a lock. Returns false when the lock is unknown or already
    /// released.
    pub async fn release(&self, lock_id: Uuid, released_by: Option<&str>) -> bool {
        let Some(mut lock) = self.registry.get(lock_id).await else {
            tracing::warn!(%lock_id, "release of unknown lock");
            return false;
        };
        if !lock.is_active {
            return false;
        }

        let branch = lock.branch_name.clone();
        let _serial = self.branch_guard(&branch).await;

        lock.is_active = false;
        lock.released_at = Some(self.clock.now_utc());
        lock.released_by = Some(released_by.unwrap_or("system").to_string());
        self.registry.remove(lock_id).await;
        let branch_state = self.state.remove_lock(&branch, lock_id).await;
        self.heartbeat.forget(lock_id).await;

        if lock.lock_type == LockType::Indexing
            && lock.lock_scope == LockScope::Branch
            && !branch_state.has_active_indexing_locks()
            && branch_state.current_state == BranchState::LockedForWrite
        {
            if let Err(e) = self
                .state
                .transition(
                    &branch,
                    BranchState::Ready,
                    released_by.unwrap_or("system"),
                    "Indexing completed, ready for merge",
                )
                .await
            {
                tracing::warn!(branch, error = %e, "post-release transition failed");
            }
        }

        counter!("branch_locks_released_total", "lock_type" => lock.lock_type.as_str())
            .increment(1);
        tracing::info!(%lock_id, branch, released_by = ?released_by, "lock released");
        true
    }

    /// Additive TTL extension for an active lock.
    pub async fn extend_ttl(
        &self,
        lock_id: Uuid,
        extension: ChronoDuration,
        extended_by: &str,
        reason: &str,
    ) -> Result<(), LockError> {
        let Some(mut lock) = self.registry.get(lock_id).await else {
            return Err(LockError::NotFound(lock_id));
        };
        if !lock.is_active {
            return Err(LockError::Inactive(lock_id));
        }
        let old_expires_at = lock.expires_at;
        lock.expires_at = old_expires_at + extension;
        self.registry.insert(lock.clone()).await;
        self.state.update_lock(&lock.branch_name, &lock).await;
        tracing::info!(
            %lock_id,
            extended_by,
            reason,
            old = %old_expires_at,
            new = %lock.expires_at,
            "lock TTL extended"
        );
        Ok(())
    }

    /// Pre-write gate derived from branch state and conflicting locks.
    pub async fn check_write_permission(
        &self,
        branch: &str,
        action: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
    ) -> (bool, Option<String>) {
        let state = self.state.get_branch_state(branch).await;
        let (allowed, reason) = state.can_write(resource_type, resource_id);
        if !allowed {
            tracing::debug!(branch, action, reason = ?reason, "write denied");
        }
        (allowed, reason)
    }

    /// Lock a branch for indexing. Defaults to one RESOURCE_TYPE lock per
    /// indexed type; `force_branch` takes a whole-branch lock instead.
    pub async fn lock_for_indexing(
        &self,
        branch: &str,
        locked_by: &str,
        reason: &str,
        resource_types: Option<Vec<String>>,
        force_branch: bool,
    ) -> Result<Vec<Uuid>, LockError> {
        let mut lock_ids = Vec::new();

        if force_branch {
            tracing::warn!(branch, locked_by, "full branch indexing lock requested");
            let id = self
                .acquire(
                    AcquireRequest::new(branch, LockType::Indexing, locked_by)
                        .reason(format!("FORCE BRANCH LOCK: {reason}")),
                )
                .await?;
            lock_ids.push(id);
        } else {
            let resource_types = resource_types.unwrap_or_else(|| {
                vec!["object_type".to_string(), "link_type".to_string(), "action_type".to_string()]
            });
            for resource_type in resource_types {
                let request = AcquireRequest::new(branch, LockType::Indexing, locked_by)
                    .scope(LockScope::ResourceType)
                    .resource_type(resource_type.clone())
                    .reason(format!("Indexing {resource_type}: {reason}"))
                    .heartbeat(true, 120);
                match self.acquire(request).await {
                    Ok(id) => lock_ids.push(id),
                    Err(LockError::Conflict { message, .. }) => {
                        tracing::warn!(branch, %resource_type, %message, "indexing lock skipped");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.state.update_indexing_metadata(branch, locked_by, true).await;
        Ok(lock_ids)
    }

    /// Release indexing locks and stamp completion metadata.
    pub async fn complete_indexing(
        &self,
        branch: &str,
        completed_by: &str,
        resource_types: Option<Vec<String>>,
    ) -> bool {
        let locks = self.registry.list(Some(branch)).await;
        let mut released = 0;
        for lock in locks {
            if lock.lock_type != LockType::Indexing || !lock.is_active {
                continue;
            }
            if let Some(types) = &resource_types {
                if !lock.resource_type.as_ref().is_some_and(|rt| types.contains(rt)) {
                    continue;
                }
            }
            if self.release(lock.id, Some(completed_by)).await {
                released += 1;
            }
        }
        self.state.update_indexing_metadata(branch, completed_by, false).await;
        released > 0
    }

    /// Direct state transition; entering ERROR releases every lock on the
    /// branch with reason `error_state`.
    pub async fn set_branch_state(
        &self,
        branch: &str,
        new_state: BranchState,
        changed_by: &str,
        reason: &str,
    ) -> Result<BranchStateInfo, LockError> {
        let state = self.state.transition(branch, new_state, changed_by, reason).await?;
        if new_state == BranchState::Error {
            let releaser = ManagerReleaser(self);
            let locks = self.registry.list(Some(branch)).await;
            self.cleanup.force_cleanup_branch(branch, locks, &releaser, "error_state").await;
        }
        Ok(state)
    }

    /// Administrative unlock of a whole branch.
    pub async fn force_unlock(&self, branch: &str, admin: &str, reason: &str) -> usize {
        tracing::warn!(branch, admin, reason, "administrative force unlock");
        let releaser = ManagerReleaser(self);
        let locks = self.registry.list(Some(branch)).await;
        self.cleanup.force_cleanup_branch(branch, locks, &releaser, reason).await
    }

    pub async fn send_heartbeat(
        &self,
        lock_id: Uuid,
        service_name: &str,
        status: HeartbeatStatus,
        progress: Option<Value>,
    ) -> bool {
        self.heartbeat.send_heartbeat(lock_id, service_name, status, progress).await
    }

    pub async fn lock_health(&self, lock_id: Uuid) -> Option<LockHealth> {
        self.heartbeat.health(lock_id).await
    }

    pub async fn get_branch_state(&self, branch: &str) -> BranchStateInfo {
        self.state.get_branch_state(branch).await
    }

    pub async fn list_active_locks(&self, branch: Option<&str>) -> Vec<BranchLock> {
        self.registry.list(branch).await
    }

    pub async fn get_lock(&self, lock_id: Uuid) -> Option<BranchLock> {
        self.registry.get(lock_id).await
    }

    pub fn cleanup_stats(&self) -> CleanupStats {
        self.cleanup.stats()
    }

    /// Whether the branch both opted into auto-merge and the policy allows
    /// it.
    pub async fn auto_merge_allowed(&self, branch: &str) -> bool {
        let state = self.state.get_branch_state(branch).await;
        state.auto_merge_enabled && self.auto_merge.should_auto_merge(branch)
    }

    async fn branch_guard(&self, branch: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.branch_serial.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(branch.to_string()).or_insert_with(|| Arc::new(TokioMutex::new(()))).clone()
        };
        mutex.lock_owned().await
    }
}

struct ManagerReleaser<'a>(&'a BranchLockManager);

#[async_trait]
impl LockReleaser for ManagerReleaser<'_> {
    async fn release(&self, lock_id: Uuid, released_by: &str) -> bool {
        self.0.release(lock_id, Some(released_by)).await
    }
}
