#![forbid(unsafe_code)]

//! # Portcullis
//!
//! Commit gating, branch locking, and dead-letter resilience for
//! distributed schema services.
//!
//! Three cooperating subsystems share one concurrency model and error
//! taxonomy:
//!
//! - **Commit hook pipeline** — validators gate every schema/data commit
//!   synchronously; sinks (event bus, audit, webhook, metrics) fan out on
//!   background tasks that never block the caller.
//! - **Branch lock manager** — branch-, resource-type-, and
//!   resource-scoped locks with TTLs, heartbeat liveness, a branch
//!   lifecycle state machine, and a periodic cleanup sweeper.
//! - **Resilience core + DLQ** — backoff calculator, retry budget,
//!   circuit breaker, and a retry executor composing them, plus a durable
//!   dead-letter queue that redelivers through that same stack.
//!
//! ## Quick start
//!
//! ```rust
//! use portcullis::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(MemoryBus::new());
//!     let audit = Arc::new(MemoryAuditRecorder::new());
//!     let pipeline = Arc::new(CommitHookPipeline::new(
//!         PipelineConfig::default(),
//!         bus.clone(),
//!         audit,
//!     ));
//!
//!     let meta = CommitMeta::new("oms", "dev/payments/schema-v3", "alice@co")
//!         .message("add Invoice type");
//!     let summary = pipeline
//!         .run(meta, json!({"@type": "ObjectType", "@id": "Invoice"}))
//!         .await?;
//!     assert_eq!(summary.status, RunStatus::Success);
//!
//!     pipeline.drain().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod breaker;
mod budget;
mod error;
mod jitter;
mod policies;
mod retry;
mod time;

pub mod audit;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod hook;
pub mod lock;
pub mod store;
pub mod validation;

// Re-exports
pub use backoff::{BackoffCalculator, BackoffSettings, BackoffStrategy};
pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use budget::{RetryBudget, RetryBudgetConfig, RetryBudgetSnapshot};
pub use error::{BoxError, ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use policies::{
    by_name as policy_by_name, RetryPolicy, AUTH, CONSERVATIVE, CRITICAL, DATABASE, NETWORK,
    STANDARD, VALIDATION, WEBHOOK,
};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use time::{
    Clock, InstantSleeper, ManualClock, ManualWallClock, MonotonicClock, Sleeper,
    SystemWallClock, TokioSleeper, TrackingSleeper, WallClock,
};

pub mod prelude;
