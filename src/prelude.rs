//! Curated re-exports for the common paths through the crate.

pub use crate::audit::{AuditEvent, AuditRecorder, AuditSeverity, MemoryAuditRecorder};
pub use crate::bus::{EventBus, MemoryBus};
pub use crate::config::PipelineConfig;
pub use crate::dlq::{
    DlqConfig, DlqHandler, DlqMessage, DlqReason, FnHandler, MessageHandler, MessageStatus,
};
pub use crate::hook::{
    CommitHook, CommitHookPipeline, CommitMeta, DiffContext, HookPhase, PipelineError,
    RunStatus, RunSummary, Sink, ValidationFailure, Validator,
};
pub use crate::lock::{
    AcquireRequest, BranchLockManager, BranchState, HeartbeatStatus, LockError, LockScope,
    LockType,
};
pub use crate::store::{KeyValueStore, MemoryStore};
pub use crate::validation::{
    Severity, ValidationCategory, ValidationError, ValidationLevel, ValidationResult,
};
pub use crate::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, Jitter,
    ResilienceError, RetryBudget, RetryConfig, RetryExecutor, RetryPolicy,
};
