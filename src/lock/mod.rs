//! Branch lock manager: registry, state machine, heartbeats, cleanup, and
//! the facade that composes them.

mod cleanup;
mod heartbeat;
mod manager;
mod registry;
mod state;
mod types;

pub use cleanup::{
    CleanupReason, CleanupStats, LockCleanupService, LockReleaser, DEFAULT_CLEANUP_BATCH_SIZE,
    DEFAULT_CLEANUP_INTERVAL,
};
pub use heartbeat::{
    HeartbeatService, HeartbeatStats, LockHealth, DEFAULT_GRACE_MULTIPLIER,
};
pub use manager::{
    AcquireRequest, AutoMergePolicy, BranchLockManager, DenyProtected, LockManagerOptions,
    PROTECTED_BRANCH_NAMES,
};
pub use registry::LockRegistry;
pub use state::{LockStateManager, MemoryStateStore, StateStore};
pub use types::{
    is_valid_transition, BranchLock, BranchState, BranchStateInfo, BranchStateTransition,
    HeartbeatHealth, HeartbeatRecord, HeartbeatStatus, LockError, LockScope, LockType,
};
