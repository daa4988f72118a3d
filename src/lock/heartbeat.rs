//! Heartbeat service: liveness beats for held locks and health reporting.

use super::registry::LockRegistry;
use super::state::LockStateManager;
use super::types::{HeartbeatHealth, HeartbeatRecord, HeartbeatStatus};
use crate::time::{SystemWallClock, WallClock};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const HISTORY_LIMIT: usize = 100;

/// Default multiplier on the heartbeat interval before a silent holder is
/// considered dead.
pub const DEFAULT_GRACE_MULTIPLIER: u32 = 3;

/// Health report for one lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHealth {
    pub lock_id: Uuid,
    pub is_active: bool,
    pub enabled: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_source: Option<String>,
    pub seconds_since: Option<i64>,
    pub health: Option<HeartbeatHealth>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub locks_monitored: usize,
    pub active_in_last_5m: usize,
    pub grace_multiplier: u32,
}

#[derive(Debug)]
pub struct HeartbeatService {
    registry: Arc<LockRegistry>,
    state: Arc<LockStateManager>,
    history: RwLock<HashMap<Uuid, VecDeque<HeartbeatRecord>>>,
    grace_multiplier: u32,
    clock: Arc<dyn WallClock>,
}

impl HeartbeatService {
    pub fn new(registry: Arc<LockRegistry>, state: Arc<LockStateManager>) -> Self {
        Self {
            registry,
            state,
            history: RwLock::new(HashMap::new()),
            grace_multiplier: DEFAULT_GRACE_MULTIPLIER,
            clock: Arc::new(SystemWallClock),
        }
    }

    pub fn with_grace_multiplier(mut self, grace_multiplier: u32) -> Self {
        self.grace_multiplier = grace_multiplier.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn grace_multiplier(&self) -> u32 {
        self.grace_multiplier
    }

    /// Record a beat for an active lock. Returns false (persisting nothing)
    /// for unknown, released, or foreign locks.
    pub async fn send_heartbeat(
        &self,
        lock_id: Uuid,
        service_name: &str,
        status: HeartbeatStatus,
        progress: Option<Value>,
    ) -> bool {
        let Some(mut lock) = self.registry.get(lock_id).await else {
            tracing::warn!(%lock_id, "heartbeat for unknown lock ignored");
            return false;
        };
        if !lock.is_active {
            tracing::warn!(%lock_id, "heartbeat for inactive lock ignored");
            return false;
        }
        let holder = lock.locked_by.as_str();
        let source = lock.heartbeat_source.as_deref();
        if service_name != holder && source.is_some_and(|s| s != service_name) {
            tracing::warn!(
                %lock_id,
                service_name,
                holder,
                "heartbeat from non-holder rejected"
            );
            return false;
        }

        let now = self.clock.now_utc();
        lock.last_heartbeat = Some(now);
        lock.heartbeat_source = Some(service_name.to_string());
        self.registry.insert(lock.clone()).await;
        self.state.update_lock(&lock.branch_name, &lock).await;

        let record = HeartbeatRecord {
            lock_id,
            branch_name: lock.branch_name.clone(),
            service_name: service_name.to_string(),
            heartbeat_at: now,
            status,
            progress,
        };

        {
            let mut history = self.history.write().await;
            let entries = history.entry(lock_id).or_default();
            entries.push_back(record.clone());
            while entries.len() > HISTORY_LIMIT {
                entries.pop_front();
            }
        }
        self.state.record_heartbeat(&record).await;

        tracing::debug!(%lock_id, service_name, status = ?status, "heartbeat recorded");
        true
    }

    /// Health classification for a lock's heartbeat stream.
    pub async fn health(&self, lock_id: Uuid) -> Option<LockHealth> {
        let lock = self.registry.get(lock_id).await?;
        let now = self.clock.now_utc();
        let seconds_since = lock.last_heartbeat.map(|last| (now - last).num_seconds());
        let health = match (lock.heartbeat_enabled(), seconds_since) {
            (true, Some(since)) => {
                let interval = lock.heartbeat_interval_s as i64;
                Some(if since <= interval {
                    HeartbeatHealth::Healthy
                } else if since <= interval * self.grace_multiplier as i64 {
                    HeartbeatHealth::Warning
                } else {
                    HeartbeatHealth::Critical
                })
            }
            _ => None,
        };
        Some(LockHealth {
            lock_id,
            is_active: lock.is_active,
            enabled: lock.heartbeat_enabled(),
            last_heartbeat: lock.last_heartbeat,
            heartbeat_source: lock.heartbeat_source.clone(),
            seconds_since,
            health,
        })
    }

    pub async fn recent_heartbeats(&self, lock_id: Uuid, limit: usize) -> Vec<HeartbeatRecord> {
        let history = self.history.read().await;
        history
            .get(&lock_id)
            .map(|entries| entries.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn forget(&self, lock_id: Uuid) {
        self.history.write().await.remove(&lock_id);
    }

    pub async fn stats(&self) -> HeartbeatStats {
        let now = self.clock.now_utc();
        let history = self.history.read().await;
        let active = history
            .values()
            .filter(|entries| {
                entries
                    .back()
                    .is_some_and(|hb| (now - hb.heartbeat_at).num_seconds() < 300)
            })
            .count();
        HeartbeatStats {
            locks_monitored: history.len(),
            active_in_last_5m: active,
            grace_multiplier: self.grace_multiplier,
        }
    }
}
