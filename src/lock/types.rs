//! Branch lock and branch state records.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle position of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchState {
    Active,
    LockedForWrite,
    Ready,
    Error,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Active => "ACTIVE",
            BranchState::LockedForWrite => "LOCKED_FOR_WRITE",
            BranchState::Ready => "READY",
            BranchState::Error => "ERROR",
        }
    }
}

/// The fixed transition relation of the branch state machine.
pub fn is_valid_transition(from: BranchState, to: BranchState) -> bool {
    use BranchState::*;
    matches!(
        (from, to),
        (Active, LockedForWrite)
            | (Active, Error)
            | (LockedForWrite, Ready)
            | (LockedForWrite, Error)
            | (Ready, Active)
            | (Ready, Error)
            | (Error, Active)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Indexing,
    Maintenance,
    Migration,
    Backup,
    Manual,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Indexing => "INDEXING",
            LockType::Maintenance => "MAINTENANCE",
            LockType::Migration => "MIGRATION",
            LockType::Backup => "BACKUP",
            LockType::Manual => "MANUAL",
        }
    }

    /// Default TTL for locks of this type.
    pub fn default_timeout(&self) -> ChronoDuration {
        match self {
            LockType::Indexing => ChronoDuration::hours(4),
            LockType::Maintenance => ChronoDuration::hours(1),
            LockType::Migration => ChronoDuration::hours(6),
            LockType::Backup => ChronoDuration::hours(2),
            LockType::Manual => ChronoDuration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockScope {
    Branch,
    ResourceType,
    Resource,
}

/// An active (or released) lock on a branch or one of its resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchLock {
    pub id: Uuid,
    pub branch_name: String,
    pub lock_type: LockType,
    pub lock_scope: LockScope,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub locked_by: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    /// 0 disables heartbeat tracking.
    pub heartbeat_interval_s: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_source: Option<String>,
    pub auto_release_enabled: bool,
    pub is_active: bool,
    pub released_at: Option<DateTime<Utc>>,
    pub released_by: Option<String>,
}

impl BranchLock {
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_interval_s > 0
    }

    pub fn is_expired_by_ttl(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired_by_heartbeat(&self, now: DateTime<Utc>, grace_multiplier: u32) -> bool {
        if !self.heartbeat_enabled() {
            return false;
        }
        match self.last_heartbeat {
            Some(last) => {
                let allowed =
                    ChronoDuration::seconds((self.heartbeat_interval_s * grace_multiplier as u64) as i64);
                now - last > allowed
            }
            None => false,
        }
    }

    /// Overlap rules: branch scope conflicts with everything on the branch;
    /// narrower scopes conflict only on matching resources.
    pub fn conflicts_with(&self, other: &BranchLock) -> bool {
        if self.branch_name != other.branch_name {
            return false;
        }
        if self.lock_scope == LockScope::Branch || other.lock_scope == LockScope::Branch {
            return true;
        }
        if self.lock_scope == LockScope::ResourceType
            && other.lock_scope == LockScope::ResourceType
        {
            return self.resource_type == other.resource_type;
        }
        if self.lock_scope == LockScope::Resource && other.lock_scope == LockScope::Resource {
            return self.resource_type == other.resource_type
                && self.resource_id == other.resource_id;
        }
        false
    }
}

/// Record of one state machine transition, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStateTransition {
    pub branch_name: String,
    pub from_state: BranchState,
    pub to_state: BranchState,
    pub transitioned_by: String,
    pub reason: String,
    pub trigger: String,
    pub transitioned_at: DateTime<Utc>,
}

/// Current state of a branch plus its active locks and indexing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStateInfo {
    pub branch_name: String,
    pub current_state: BranchState,
    pub previous_state: Option<BranchState>,
    pub state_changed_at: DateTime<Utc>,
    pub state_changed_by: String,
    pub state_change_reason: String,
    #[serde(default)]
    pub active_locks: Vec<BranchLock>,
    pub indexing_started_at: Option<DateTime<Utc>>,
    pub indexing_completed_at: Option<DateTime<Utc>>,
    pub indexing_service: Option<String>,
    #[serde(default)]
    pub auto_merge_enabled: bool,
}

impl BranchStateInfo {
    pub fn initial(branch_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            branch_name: branch_name.into(),
            current_state: BranchState::Active,
            previous_state: None,
            state_changed_at: now,
            state_changed_by: "system".to_string(),
            state_change_reason: "Initial state".to_string(),
            active_locks: Vec::new(),
            indexing_started_at: None,
            indexing_completed_at: None,
            indexing_service: None,
            auto_merge_enabled: false,
        }
    }

    pub fn has_active_indexing_locks(&self) -> bool {
        self.active_locks
            .iter()
            .any(|lock| lock.is_active && lock.lock_type == LockType::Indexing)
    }

    /// Pre-write gate: whether a write to the given resource would conflict
    /// with the branch state or an active lock.
    pub fn can_write(
        &self,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
    ) -> (bool, Option<String>) {
        if self.current_state == BranchState::Error {
            return (false, Some(format!("branch {} is in ERROR state", self.branch_name)));
        }

        for lock in self.active_locks.iter().filter(|l| l.is_active) {
            let blocked = match lock.lock_scope {
                LockScope::Branch => true,
                LockScope::ResourceType => {
                    resource_type.is_some() && lock.resource_type.as_deref() == resource_type
                }
                LockScope::Resource => {
                    resource_type.is_some()
                        && resource_id.is_some()
                        && lock.resource_type.as_deref() == resource_type
                        && lock.resource_id.as_deref() == resource_id
                }
            };
            if blocked {
                return (
                    false,
                    Some(format!(
                        "blocked by {} lock {} held by {}: {}",
                        lock.lock_type.as_str(),
                        lock.id,
                        lock.locked_by,
                        lock.reason
                    )),
                );
            }
        }
        (true, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Healthy,
    Warning,
    Error,
}

/// One liveness beat for a lock, append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub lock_id: Uuid,
    pub branch_name: String,
    pub service_name: String,
    pub heartbeat_at: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub progress: Option<Value>,
}

/// Health classification derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatHealth {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock conflict on {branch}: {message}")]
    Conflict { branch: String, message: String },
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: BranchState, to: BranchState },
    #[error("invalid lock request: {0}")]
    InvalidScope(String),
    #[error("lock {0} not found")]
    NotFound(Uuid),
    #[error("lock {0} is not active")]
    Inactive(Uuid),
}
