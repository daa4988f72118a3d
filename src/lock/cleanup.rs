//! Lock cleanup: releases TTL-expired and heartbeat-expired locks.

use super::types::BranchLock;
use crate::time::{SystemWallClock, WallClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 100;

/// Why the sweeper released a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    TtlExpired,
    HeartbeatMissed,
}

impl CleanupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::TtlExpired => "TTL_EXPIRED",
            CleanupReason::HeartbeatMissed => "HEARTBEAT_MISSED",
        }
    }
}

/// The sweeper's hook back into the lock facade.
#[async_trait]
pub trait LockReleaser: Send + Sync {
    async fn release(&self, lock_id: Uuid, released_by: &str) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub total_cleaned: u64,
    pub ttl_expired: u64,
    pub heartbeat_expired: u64,
    pub forced: u64,
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct LockCleanupService {
    pub cleanup_interval: Duration,
    pub batch_size: usize,
    grace_multiplier: u32,
    clock: Arc<dyn WallClock>,
    stats: Mutex<CleanupStats>,
}

impl Default for LockCleanupService {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_INTERVAL, DEFAULT_CLEANUP_BATCH_SIZE, 3)
    }
}

impl LockCleanupService {
    pub fn new(cleanup_interval: Duration, batch_size: usize, grace_multiplier: u32) -> Self {
        Self {
            cleanup_interval,
            batch_size: batch_size.max(1),
            grace_multiplier: grace_multiplier.max(1),
            clock: Arc::new(SystemWallClock),
            stats: Mutex::new(CleanupStats::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// One sweep over the active locks. Returns `(lock_id, reason)` for
    /// every lock released this cycle.
    pub async fn sweep<R: LockReleaser>(
        &self,
        active_locks: Vec<BranchLock>,
        releaser: &R,
    ) -> Vec<(Uuid, CleanupReason)> {
        let now = self.clock.now_utc();
        let mut cleaned = Vec::new();

        for batch in active_locks.chunks(self.batch_size) {
            for lock in batch {
                if !lock.is_active || !lock.auto_release_enabled {
                    continue;
                }
                let reason = if lock.is_expired_by_ttl(now) {
                    Some(CleanupReason::TtlExpired)
                } else if lock.is_expired_by_heartbeat(now, self.grace_multiplier) {
                    Some(CleanupReason::HeartbeatMissed)
                } else {
                    None
                };
                let Some(reason) = reason else { continue };

                let released_by = format!("system_cleanup_{}", reason.as_str());
                if releaser.release(lock.id, &released_by).await {
                    cleaned.push((lock.id, reason));
                    let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
                    stats.total_cleaned += 1;
                    match reason {
                        CleanupReason::TtlExpired => stats.ttl_expired += 1,
                        CleanupReason::HeartbeatMissed => stats.heartbeat_expired += 1,
                    }
                    match reason {
                        CleanupReason::TtlExpired => tracing::info!(
                            lock_id = %lock.id,
                            branch = %lock.branch_name,
                            "TTL expired lock released"
                        ),
                        CleanupReason::HeartbeatMissed => tracing::warn!(
                            lock_id = %lock.id,
                            branch = %lock.branch_name,
                            source = ?lock.heartbeat_source,
                            "heartbeat expired lock released"
                        ),
                    }
                }
            }
            // Yield between batches so a large sweep cannot hog the worker.
            tokio::task::yield_now().await;
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.last_cleanup_at = Some(now);
        }
        if !cleaned.is_empty() {
            tracing::info!(count = cleaned.len(), "cleanup cycle released locks");
        }
        cleaned
    }

    /// Release every active lock on a branch regardless of expiry.
    pub async fn force_cleanup_branch<R: LockReleaser>(
        &self,
        branch: &str,
        active_locks: Vec<BranchLock>,
        releaser: &R,
        reason: &str,
    ) -> usize {
        let mut count = 0;
        for lock in active_locks {
            if lock.branch_name != branch || !lock.is_active {
                continue;
            }
            if releaser.release(lock.id, &format!("system_{reason}")).await {
                count += 1;
            }
        }
        if count > 0 {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.total_cleaned += count as u64;
            stats.forced += count as u64;
            tracing::info!(branch, count, reason, "force-released branch locks");
        }
        count
    }

    pub fn stats(&self) -> CleanupStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::types::{LockScope, LockType};
    use crate::time::ManualWallClock;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashSet;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct RecordingReleaser {
        released: TokioMutex<Vec<(Uuid, String)>>,
    }

    #[async_trait]
    impl LockReleaser for RecordingReleaser {
        async fn release(&self, lock_id: Uuid, released_by: &str) -> bool {
            self.released.lock().await.push((lock_id, released_by.to_string()));
            true
        }
    }

    fn lock(
        clock: &ManualWallClock,
        branch: &str,
        ttl: ChronoDuration,
        heartbeat_interval_s: u64,
    ) -> BranchLock {
        let now = clock.now_utc();
        BranchLock {
            id: Uuid::new_v4(),
            branch_name: branch.into(),
            lock_type: LockType::Indexing,
            lock_scope: LockScope::Branch,
            resource_type: None,
            resource_id: None,
            locked_by: "funnel-service".into(),
            acquired_at: now,
            expires_at: now + ttl,
            reason: "indexing".into(),
            heartbeat_interval_s,
            last_heartbeat: (heartbeat_interval_s > 0).then_some(now),
            heartbeat_source: None,
            auto_release_enabled: true,
            is_active: true,
            released_at: None,
            released_by: None,
        }
    }

    #[tokio::test]
    async fn sweep_releases_ttl_expired_locks() {
        let clock = ManualWallClock::new();
        let service = LockCleanupService::new(Duration::from_secs(300), 100, 3)
            .with_clock(Arc::new(clock.clone()));
        let expired = lock(&clock, "a/b/c", ChronoDuration::seconds(10), 0);
        let fresh = lock(&clock, "a/b/c", ChronoDuration::hours(1), 0);

        clock.advance(Duration::from_secs(60));
        let releaser = RecordingReleaser::default();
        let cleaned = service.sweep(vec![expired.clone(), fresh], &releaser).await;

        assert_eq!(cleaned, vec![(expired.id, CleanupReason::TtlExpired)]);
        let released = releaser.released.lock().await;
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1, "system_cleanup_TTL_EXPIRED");
        assert_eq!(service.stats().ttl_expired, 1);
    }

    #[tokio::test]
    async fn sweep_releases_heartbeat_expired_locks() {
        let clock = ManualWallClock::new();
        let service = LockCleanupService::new(Duration::from_secs(300), 100, 3)
            .with_clock(Arc::new(clock.clone()));
        // 5s interval, grace 3 => dead after 15s of silence.
        let silent = lock(&clock, "a/b/c", ChronoDuration::hours(4), 5);

        clock.advance(Duration::from_secs(20));
        let releaser = RecordingReleaser::default();
        let cleaned = service.sweep(vec![silent.clone()], &releaser).await;

        assert_eq!(cleaned, vec![(silent.id, CleanupReason::HeartbeatMissed)]);
        let released = releaser.released.lock().await;
        assert_eq!(released[0].1, "system_cleanup_HEARTBEAT_MISSED");
        assert_eq!(service.stats().heartbeat_expired, 1);
    }

    #[tokio::test]
    async fn auto_release_disabled_locks_are_left_alone() {
        let clock = ManualWallClock::new();
        let service = LockCleanupService::new(Duration::from_secs(300), 100, 3)
            .with_clock(Arc::new(clock.clone()));
        let mut pinned = lock(&clock, "a/b/c", ChronoDuration::seconds(1), 0);
        pinned.auto_release_enabled = false;

        clock.advance(Duration::from_secs(60));
        let releaser = RecordingReleaser::default();
        assert!(service.sweep(vec![pinned], &releaser).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_handles_more_locks_than_one_batch() {
        let clock = ManualWallClock::new();
        let service = LockCleanupService::new(Duration::from_secs(300), 10, 3)
            .with_clock(Arc::new(clock.clone()));
        let locks: Vec<BranchLock> =
            (0..35).map(|_| lock(&clock, "a/b/c", ChronoDuration::seconds(1), 0)).collect();
        let expected: HashSet<Uuid> = locks.iter().map(|l| l.id).collect();

        clock.advance(Duration::from_secs(10));
        let releaser = RecordingReleaser::default();
        let cleaned = service.sweep(locks, &releaser).await;
        assert_eq!(cleaned.len(), 35);
        assert_eq!(cleaned.iter().map(|(id, _)| *id).collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn force_cleanup_targets_one_branch() {
        let clock = ManualWallClock::new();
        let service = LockCleanupService::default().with_clock(Arc::new(clock.clone()));
        let a = lock(&clock, "prod/api/main", ChronoDuration::hours(1), 0);
        let b = lock(&clock, "dev/api/main", ChronoDuration::hours(1), 0);

        let releaser = RecordingReleaser::default();
        let count = service
            .force_cleanup_branch("prod/api/main", vec![a.clone(), b], &releaser, "error_state")
            .await;

        assert_eq!(count, 1);
        let released = releaser.released.lock().await;
        assert_eq!(released[0].0, a.id);
        assert_eq!(released[0].1, "system_error_state");
        assert_eq!(service.stats().forced, 1);
    }
}
