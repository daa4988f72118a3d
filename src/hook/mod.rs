//! Commit hook pipeline: context building, validators, sinks, and hooks.

mod context;
mod hooks;
mod pipeline;
mod sink;
mod validator;

pub use context::{BranchPath, BranchPathError, CommitMeta, DiffContext};
pub use hooks::{CommitHook, HookPhase};
pub use pipeline::{CommitHookPipeline, PipelineError, RunStatus, RunSummary, SINK_DLQ_QUEUE};
pub use sink::{AuditEventSink, BusSink, MetricsSink, Sink, WebhookSink};
pub use validator::{
    PiiValidator, RuleValidator, SchemaValidator, TamperValidator, ValidationFailure, Validator,
};
