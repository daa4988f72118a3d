//! Commit hooks: user-registered steps around the validation/sink phases.

use super::context::DiffContext;
use crate::error::BoxError;
use async_trait::async_trait;

/// When a hook runs relative to the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    /// Before validators; a failure aborts the commit.
    Pre,
    /// After validators; failures are logged only.
    Post,
    /// Scheduled with the sinks, detached from the caller.
    Async,
}

#[async_trait]
pub trait CommitHook: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    fn phase(&self) -> HookPhase;

    async fn execute(&self, ctx: &DiffContext) -> Result<(), BoxError>;

    async fn cleanup(&self) {}
}
