//! Commit hook pipeline: validators gate the commit, sinks fan out behind
//! it.
//!
//! One long-lived pipeline value is owned by the service root and handed
//! to request handlers. Registries are append-only and snapshotted at
//! entry, so registration is safe concurrently with `run`. Background sink
//! and hook tasks are tracked so shutdown can drain them.

use super::context::{BranchPathError, CommitMeta, DiffContext};
use super::hooks::{CommitHook, HookPhase};
use super::sink::{AuditEventSink, BusSink, MetricsSink, Sink, WebhookSink};
use super::validator::{
    PiiValidator, RuleValidator, SchemaValidator, TamperValidator, Validator,
};
use crate::audit::{AuditEvent, AuditRecorder, AuditSeverity};
use crate::bus::EventBus;
use crate::config::PipelineConfig;
use crate::dlq::{DlqHandler, DlqReason};
use crate::validation::{BasicRuleEngine, Severity, ValidationCategory, ValidationError};
use arc_swap::ArcSwap;
use metrics::counter;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

/// Author prefixes allowed to commit past the size gate.
const SIZE_BYPASS_PREFIXES: [&str; 4] = ["system@", "admin@", "migration@", "import@"];

/// Queue that absorbs failed sink deliveries when a DLQ is attached.
pub const SINK_DLQ_QUEUE: &str = "commit_sinks";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed with {} errors", errors.len())]
    ValidationFailed { errors: Vec<ValidationError> },
    #[error("pre-commit hook {name} failed")]
    HookFailed { name: String },
    #[error(transparent)]
    InvalidBranch(#[from] BranchPathError),
}

impl PipelineError {
    /// Stable error code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::ValidationFailed { errors }
                if errors.iter().any(|e| e.code == "size_limit") =>
            {
                "SIZE_LIMIT_EXCEEDED"
            }
            PipelineError::ValidationFailed { .. } => "VALIDATION_FAILED",
            PipelineError::HookFailed { .. } => "HOOK_FAILED",
            PipelineError::InvalidBranch(_) => "INVALID_BRANCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Skipped { reason: String, authorized: bool },
}

/// Summary returned to the commit caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: RunStatus,
    pub validators_run: usize,
    pub sinks_run: usize,
    pub validation_errors: Vec<ValidationError>,
}

type Registry<T> = ArcSwap<Vec<Arc<T>>>;

pub struct CommitHookPipeline {
    config: PipelineConfig,
    audit: Arc<dyn AuditRecorder>,
    validators: Registry<dyn Validator>,
    sinks: Registry<dyn Sink>,
    pre_hooks: Registry<dyn CommitHook>,
    post_hooks: Registry<dyn CommitHook>,
    async_hooks: Registry<dyn CommitHook>,
    dlq: Option<Arc<DlqHandler>>,
    initialized: OnceCell<()>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl CommitHookPipeline {
    /// Pipeline with the default validator and sink sets.
    pub fn new(
        config: PipelineConfig,
        bus: Arc<dyn EventBus>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        let validators: Vec<Arc<dyn Validator>> = vec![
            Arc::new(TamperValidator::new(config.strict_security, audit.clone())),
            Arc::new(SchemaValidator::default()),
            Arc::new(PiiValidator::new(config.enable_pii_validation)),
            Arc::new(RuleValidator::with_cache_ttl(
                Arc::new(BasicRuleEngine::new()),
                config.strict_validation,
                audit.clone(),
                config.schema_cache_ttl,
            )),
        ];
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(BusSink::new(bus, config.topic_prefix.clone())),
            Arc::new(AuditEventSink::new(audit.clone())),
            Arc::new(MetricsSink),
            Arc::new(WebhookSink::new(config.webhook_url.clone(), config.webhook_timeout)),
        ];
        Self::with_components(config, validators, sinks, audit)
    }

    /// Pipeline with explicit component sets.
    pub fn with_components(
        config: PipelineConfig,
        validators: Vec<Arc<dyn Validator>>,
        sinks: Vec<Arc<dyn Sink>>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self {
            config,
            audit,
            validators: ArcSwap::from_pointee(validators),
            sinks: ArcSwap::from_pointee(sinks),
            pre_hooks: ArcSwap::from_pointee(Vec::new()),
            post_hooks: ArcSwap::from_pointee(Vec::new()),
            async_hooks: ArcSwap::from_pointee(Vec::new()),
            dlq: None,
            initialized: OnceCell::new(),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Route failed sink deliveries into this DLQ.
    pub fn with_dlq(mut self, dlq: Arc<DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Initialize every component once, isolating per-component failures.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                tracing::info!("initializing commit hook pipeline");
                for validator in self.validators.load().iter() {
                    if !validator.enabled() {
                        continue;
                    }
                    match validator.initialize().await {
                        Ok(()) => tracing::info!(name = validator.name(), "validator initialized"),
                        Err(e) => {
                            tracing::error!(name = validator.name(), error = %e, "validator init failed")
                        }
                    }
                }
                for sink in self.sinks.load().iter() {
                    if !sink.enabled() {
                        continue;
                    }
                    match sink.initialize().await {
                        Ok(()) => tracing::info!(name = sink.name(), "sink initialized"),
                        Err(e) => {
                            tracing::error!(name = sink.name(), error = %e, "sink init failed")
                        }
                    }
                }
            })
            .await;
    }

    /// Process one commit.
    pub async fn run(
        &self,
        meta: CommitMeta,
        diff: serde_json::Value,
    ) -> Result<RunSummary, PipelineError> {
        self.initialize().await;

        let ctx = Arc::new(DiffContext::build(meta, diff)?);
        let validators = self.validators.load_full();
        let sinks = self.sinks.load_full();

        // Size gate: reject unauthorized oversize commits, audit the rest.
        let diff_size = ctx.diff_size();
        if diff_size > self.config.max_diff_size {
            if !self.is_authorized_for_size_bypass(&ctx.meta.author) {
                tracing::error!(
                    author = %ctx.meta.author,
                    branch = %ctx.meta.branch,
                    diff_size,
                    limit = self.config.max_diff_size,
                    "unauthorized validation bypass attempt"
                );
                return Err(PipelineError::ValidationFailed {
                    errors: vec![ValidationError::new(
                        "diff",
                        "size_limit",
                        format!(
                            "diff size {} exceeds {} bytes; contact an admin for large commits",
                            diff_size, self.config.max_diff_size
                        ),
                        ValidationCategory::Performance,
                        Severity::Critical,
                    )
                    .with_context("size", json!(diff_size))
                    .with_context("limit", json!(self.config.max_diff_size))],
                });
            }

            tracing::error!(
                security_event = "VALIDATION_BYPASS_SIZE",
                author = %ctx.meta.author,
                branch = %ctx.meta.branch,
                trace_id = %ctx.meta.trace_id,
                diff_size,
                limit = self.config.max_diff_size,
                "authorized user bypassing validation for large diff"
            );
            let audit = self.audit.clone();
            let bypass_ctx = ctx.clone();
            let size_detail = format!("diff size {diff_size} over limit");
            self.spawn_tracked(async move {
                audit_size_bypass(&audit, &bypass_ctx, &size_detail).await;
            });

            let sinks_run = self.schedule_sinks(&ctx, &sinks);
            return Ok(RunSummary {
                status: RunStatus::Skipped {
                    reason: "diff_too_large".to_string(),
                    authorized: true,
                },
                validators_run: 0,
                sinks_run,
                validation_errors: Vec::new(),
            });
        }

        // Pre-commit hooks gate the commit.
        for hook in self.pre_hooks.load_full().iter().filter(|h| h.enabled()) {
            if let Err(e) = hook.execute(&ctx).await {
                tracing::error!(name = hook.name(), error = %e, "pre-commit hook failed");
                return Err(PipelineError::HookFailed { name: hook.name().to_string() });
            }
        }

        let validators_run = validators.iter().filter(|v| v.enabled()).count();
        if self.config.async_validation {
            let audit = self.audit.clone();
            let timeout = self.config.validation_timeout;
            let async_ctx = ctx.clone();
            let async_validators = validators.clone();
            self.spawn_tracked(async move {
                let errors = run_validators(&async_ctx, &async_validators, timeout).await;
                if errors.is_empty() {
                    return;
                }
                tracing::warn!(
                    count = errors.len(),
                    "async validation found errors (non-blocking)"
                );
                for error in errors.iter().filter(|e| e.severity.blocks_commit()) {
                    let event = AuditEvent::new("ASYNC_VALIDATION_FAILURE", "DATA_MANAGEMENT")
                        .severity(AuditSeverity::Error)
                        .user(async_ctx.meta.author.clone(), async_ctx.meta.author.clone())
                        .target("DOCUMENT", error.field.clone())
                        .operation("VALIDATE")
                        .branch(async_ctx.meta.branch.clone())
                        .request_id(async_ctx.meta.trace_id.clone())
                        .meta("code", json!(error.code))
                        .meta("message", json!(error.message));
                    if let Err(e) = audit.record(event).await {
                        tracing::error!(error = %e, "failed to audit async validation failure");
                    }
                }
            });
        } else {
            let errors =
                run_validators(&ctx, &validators, self.config.validation_timeout).await;
            if !errors.is_empty() {
                return Err(PipelineError::ValidationFailed { errors });
            }
        }

        // Post-commit hooks never fail the commit.
        for hook in self.post_hooks.load_full().iter().filter(|h| h.enabled()) {
            if let Err(e) = hook.execute(&ctx).await {
                tracing::error!(name = hook.name(), error = %e, "post-commit hook failed");
            }
        }

        let sinks_run = self.schedule_sinks(&ctx, &sinks);

        for hook in self.async_hooks.load_full().iter().filter(|h| h.enabled()).cloned() {
            let hook_ctx = ctx.clone();
            self.spawn_tracked(async move {
                if let Err(e) = hook.execute(&hook_ctx).await {
                    tracing::error!(name = hook.name(), error = %e, "async hook failed");
                }
            });
        }

        Ok(RunSummary {
            status: RunStatus::Success,
            validators_run,
            sinks_run,
            validation_errors: Vec::new(),
        })
    }

    /// Fan sinks out onto background tasks. Returns how many were
    /// scheduled; their outcomes never affect the caller.
    fn schedule_sinks(&self, ctx: &Arc<DiffContext>, sinks: &[Arc<dyn Sink>]) -> usize {
        let mut scheduled = 0;
        for sink in sinks.iter().filter(|s| s.enabled()).cloned() {
            scheduled += 1;
            let dlq = self.dlq.clone();
            let sink_ctx = ctx.clone();
            self.spawn_tracked(async move {
                let deadline = sink.timeout();
                match tokio::time::timeout(deadline, sink.publish(&sink_ctx)).await {
                    Ok(Ok(())) => {
                        tracing::debug!(name = sink.name(), "sink completed");
                    }
                    Ok(Err(e)) => {
                        counter!("commit_sink_failures_total", "sink" => sink.name().to_string())
                            .increment(1);
                        tracing::error!(name = sink.name(), error = %e, "sink failed");
                        route_sink_failure(&dlq, sink.name(), &sink_ctx, e.to_string(), false)
                            .await;
                    }
                    Err(_) => {
                        counter!("commit_sink_timeouts_total", "sink" => sink.name().to_string())
                            .increment(1);
                        tracing::error!(name = sink.name(), ?deadline, "sink timed out");
                        route_sink_failure(
                            &dlq,
                            sink.name(),
                            &sink_ctx,
                            format!("sink timed out after {deadline:?}"),
                            true,
                        )
                        .await;
                    }
                }
            });
        }
        scheduled
    }

    fn is_authorized_for_size_bypass(&self, author: &str) -> bool {
        SIZE_BYPASS_PREFIXES.iter().any(|prefix| author.starts_with(prefix))
    }

    /// Register a custom validator (append-only, safe during `run`).
    pub fn register_validator(&self, validator: Arc<dyn Validator>) {
        tracing::info!(name = validator.name(), "validator registered");
        self.validators.rcu(|current| {
            let mut next = (**current).clone();
            next.push(validator.clone());
            next
        });
    }

    pub fn register_sink(&self, sink: Arc<dyn Sink>) {
        tracing::info!(name = sink.name(), "sink registered");
        self.sinks.rcu(|current| {
            let mut next = (**current).clone();
            next.push(sink.clone());
            next
        });
    }

    pub fn register_hook(&self, hook: Arc<dyn CommitHook>) {
        tracing::info!(name = hook.name(), phase = ?hook.phase(), "hook registered");
        let registry = match hook.phase() {
            HookPhase::Pre => &self.pre_hooks,
            HookPhase::Post => &self.post_hooks,
            HookPhase::Async => &self.async_hooks,
        };
        registry.rcu(|current| {
            let mut next = (**current).clone();
            next.push(hook.clone());
            next
        });
    }

    /// Wait for every scheduled background task to finish.
    pub async fn drain(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = {
                let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
                guard.drain(..).collect()
            };
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }

    /// Drain background work and run component cleanup.
    pub async fn shutdown(&self) {
        self.drain().await;
        for validator in self.validators.load().iter() {
            validator.cleanup().await;
        }
        for sink in self.sinks.load().iter() {
            sink.cleanup().await;
        }
        tracing::info!("commit hook pipeline shut down");
    }

    fn spawn_tracked(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

/// Run each enabled validator under its deadline, collecting every error.
async fn run_validators(
    ctx: &DiffContext,
    validators: &[Arc<dyn Validator>],
    deadline: std::time::Duration,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    for validator in validators.iter().filter(|v| v.enabled()) {
        match tokio::time::timeout(deadline, validator.validate(ctx)).await {
            Ok(Ok(())) => tracing::debug!(name = validator.name(), "validator passed"),
            Ok(Err(failure)) => {
                tracing::warn!(
                    name = validator.name(),
                    count = failure.errors.len(),
                    "validator failed"
                );
                errors.extend(failure.errors);
            }
            Err(_) => {
                tracing::error!(name = validator.name(), "validator timed out");
                errors.push(ValidationError::new(
                    validator.name(),
                    "VALIDATION_TIMEOUT",
                    format!("validator {} exceeded {deadline:?}", validator.name()),
                    ValidationCategory::Performance,
                    Severity::High,
                ));
            }
        }
    }
    errors
}

/// Park a failed sink delivery in the DLQ, when one is attached.
async fn route_sink_failure(
    dlq: &Option<Arc<DlqHandler>>,
    sink_name: &str,
    ctx: &DiffContext,
    error: String,
    timed_out: bool,
) {
    let Some(dlq) = dlq else { return };
    let reason = if timed_out {
        DlqReason::Timeout
    } else if sink_name == "WebhookSink" {
        DlqReason::WebhookFailed
    } else {
        DlqReason::ExecutionFailed
    };
    let original = json!({
        "sink": sink_name,
        "database": ctx.meta.database,
        "branch": ctx.meta.branch,
        "commit_id": ctx.meta.commit_id,
        "trace_id": ctx.meta.trace_id,
    });
    if let Err(e) = dlq
        .send_to_dlq(
            SINK_DLQ_QUEUE,
            original,
            reason,
            &error,
            0,
            HashMap::from([("sink".to_string(), json!(sink_name))]),
        )
        .await
    {
        tracing::error!(sink = sink_name, error = %e, "failed to park sink failure in DLQ");
    }
}

/// CRITICAL audit record for an authorized size-gate bypass.
async fn audit_size_bypass(audit: &Arc<dyn AuditRecorder>, ctx: &DiffContext, detail: &str) {
    let event = AuditEvent::new("VALIDATION_BYPASS", "SECURITY")
        .severity(AuditSeverity::Critical)
        .user(ctx.meta.author.clone(), ctx.meta.author.clone())
        .target("DOCUMENT", ctx.meta.commit_id.clone().unwrap_or_else(|| "unknown".into()))
        .operation("BYPASS")
        .branch(ctx.meta.branch.clone())
        .request_id(ctx.meta.trace_id.clone())
        .meta("bypass_type", json!("diff_size_limit"))
        .meta("detail", json!(detail));
    if let Err(e) = audit.record(event).await {
        tracing::error!(error = %e, "failed to audit size bypass");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditRecorder;
    use crate::bus::MemoryBus;
    use crate::error::BoxError;
    use crate::hook::validator::ValidationFailure;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta() -> CommitMeta {
        CommitMeta::new("oms", "dev/payments/schema-v3", "alice@co")
            .commit_id("c-1")
            .message("test commit")
            .trace_id("t-1")
    }

    fn pipeline() -> (Arc<CommitHookPipeline>, Arc<MemoryBus>, Arc<MemoryAuditRecorder>) {
        let bus = Arc::new(MemoryBus::new());
        let audit = Arc::new(MemoryAuditRecorder::new());
        let pipeline = Arc::new(CommitHookPipeline::new(
            PipelineConfig::default(),
            bus.clone(),
            audit.clone(),
        ));
        (pipeline, bus, audit)
    }

    fn valid_diff() -> Value {
        json!({
            "@type": "ObjectType",
            "@id": "Invoice",
            "after": {
                "@type": "ObjectType",
                "@id": "Invoice",
                "name": "Invoice",
                "created_by": "alice",
                "created_at": "2026-07-01T12:00:00Z",
            },
        })
    }

    struct CountingValidator {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Validator for CountingValidator {
        fn name(&self) -> &str {
            "counting"
        }

        async fn validate(&self, _ctx: &DiffContext) -> Result<(), ValidationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ValidationFailure::single(ValidationError::new(
                    "x",
                    "ALWAYS_FAILS",
                    "no",
                    ValidationCategory::Business,
                    Severity::High,
                )))
            } else {
                Ok(())
            }
        }
    }

    struct PhaseHook {
        phase: HookPhase,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommitHook for PhaseHook {
        fn name(&self) -> &str {
            "phase-hook"
        }

        fn phase(&self) -> HookPhase {
            self.phase
        }

        async fn execute(&self, _ctx: &DiffContext) -> Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("hook failure".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn happy_commit_runs_all_validators_and_sinks() {
        let (pipeline, bus, audit) = pipeline();
        let summary = pipeline.run(meta(), valid_diff()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.validators_run, 4);
        // Webhook sink is disabled without a URL.
        assert_eq!(summary.sinks_run, 3);
        assert!(summary.validation_errors.is_empty());

        pipeline.drain().await;
        assert_eq!(bus.events_for("terminus.commit.dev.payments").await.len(), 1);
        let audit_events = audit.events_of_type("DATA_COMMIT").await;
        assert_eq!(audit_events.len(), 1);
        assert_eq!(audit_events[0].operation, "CREATE");
    }

    #[tokio::test]
    async fn validation_failure_blocks_commit_and_sinks() {
        let (pipeline, bus, _) = pipeline();
        let diff = json!({"after": {
            "@type": "ObjectType",
            "name": "bad_name",
            "created_by": "alice",
            "created_at": "2026-07-01T12:00:00Z",
            "@id": "bad",
        }});
        let err = pipeline.run(meta(), diff).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");

        pipeline.drain().await;
        assert!(bus.events().await.is_empty(), "no sinks on failed commit");
    }

    #[tokio::test]
    async fn invalid_branch_fails_at_context_build() {
        let (pipeline, _, _) = pipeline();
        let bad = CommitMeta::new("oms", "not-a-branch", "alice@co");
        let err = pipeline.run(bad, json!({})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_BRANCH");
    }

    #[tokio::test]
    async fn oversize_commit_is_rejected_for_normal_users() {
        let bus = Arc::new(MemoryBus::new());
        let audit = Arc::new(MemoryAuditRecorder::new());
        let config = PipelineConfig { max_diff_size: 64, ..Default::default() };
        let pipeline =
            Arc::new(CommitHookPipeline::new(config, bus.clone(), audit.clone()));

        let big = json!({"payload": "x".repeat(256)});
        let err = pipeline.run(meta(), big).await.unwrap_err();
        assert_eq!(err.code(), "SIZE_LIMIT_EXCEEDED");
        match err {
            PipelineError::ValidationFailed { errors } => {
                assert_eq!(errors[0].code, "size_limit");
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
        pipeline.drain().await;
        assert!(bus.events().await.is_empty());
    }

    #[tokio::test]
    async fn oversize_commit_from_migration_user_is_audited_and_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let audit = Arc::new(MemoryAuditRecorder::new());
        let config = PipelineConfig { max_diff_size: 64, ..Default::default() };
        let pipeline =
            Arc::new(CommitHookPipeline::new(config, bus.clone(), audit.clone()));

        let big = json!({"payload": "x".repeat(256)});
        let author = CommitMeta::new("oms", "dev/payments/schema-v3", "migration@co");
        let summary = pipeline.run(author, big).await.unwrap();
        assert_eq!(
            summary.status,
            RunStatus::Skipped { reason: "diff_too_large".into(), authorized: true }
        );
        assert_eq!(summary.validators_run, 0);
        assert!(summary.sinks_run > 0);

        pipeline.drain().await;
        let bypasses = audit.events_of_type("VALIDATION_BYPASS").await;
        assert_eq!(bypasses.len(), 1);
        assert_eq!(bypasses[0].severity, AuditSeverity::Critical);
        assert_eq!(bypasses[0].metadata["bypass_type"], "diff_size_limit");
        // Sinks still ran for the oversize commit.
        assert_eq!(bus.events_for("terminus.commit.dev.payments").await.len(), 1);
    }

    #[tokio::test]
    async fn boundary_diff_at_exact_limit_is_accepted() {
        let bus = Arc::new(MemoryBus::new());
        let audit = Arc::new(MemoryAuditRecorder::new());
        let probe = json!({"p": "x"});
        let base_size = probe.to_string().len();

        let config =
            PipelineConfig { max_diff_size: base_size, ..Default::default() };
        let pipeline = Arc::new(CommitHookPipeline::new(config, bus, audit));

        // Exactly at the limit passes.
        assert!(pipeline.run(meta(), probe.clone()).await.is_ok());

        // One byte over fails.
        let over = json!({"p": "xx"});
        let err = pipeline.run(meta(), over).await.unwrap_err();
        assert_eq!(err.code(), "SIZE_LIMIT_EXCEEDED");
        pipeline.drain().await;
    }

    #[tokio::test]
    async fn failing_pre_hook_aborts_commit() {
        let (pipeline, bus, _) = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register_hook(Arc::new(PhaseHook {
            phase: HookPhase::Pre,
            fail: true,
            calls: calls.clone(),
        }));

        let err = pipeline.run(meta(), valid_diff()).await.unwrap_err();
        assert_eq!(err.code(), "HOOK_FAILED");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        pipeline.drain().await;
        assert!(bus.events().await.is_empty());
    }

    #[tokio::test]
    async fn failing_post_hook_does_not_abort() {
        let (pipeline, _, _) = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register_hook(Arc::new(PhaseHook {
            phase: HookPhase::Post,
            fail: true,
            calls: calls.clone(),
        }));

        let summary = pipeline.run(meta(), valid_diff()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        pipeline.drain().await;
    }

    #[tokio::test]
    async fn async_hooks_run_detached() {
        let (pipeline, _, _) = pipeline();
        let calls = Arc::new(AtomicUsize::new(0));
        pipeline.register_hook(Arc::new(PhaseHook {
            phase: HookPhase::Async,
            fail: false,
            calls: calls.clone(),
        }));

        pipeline.run(meta(), valid_diff()).await.unwrap();
        pipeline.drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registered_validator_is_picked_up_and_counted() {
        let (pipeline, _, _) = pipeline();
        let validator =
            Arc::new(CountingValidator { calls: AtomicUsize::new(0), fail: false });
        pipeline.register_validator(validator.clone());

        let summary = pipeline.run(meta(), valid_diff()).await.unwrap();
        assert_eq!(summary.validators_run, 5);
        assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
        pipeline.drain().await;
    }

    #[tokio::test]
    async fn async_validation_mode_never_blocks_commit() {
        let bus = Arc::new(MemoryBus::new());
        let audit = Arc::new(MemoryAuditRecorder::new());
        let config = PipelineConfig { async_validation: true, ..Default::default() };
        let pipeline =
            Arc::new(CommitHookPipeline::new(config, bus, audit.clone()));
        pipeline.register_validator(Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
            fail: true,
        }));

        // The commit succeeds even though a validator fails.
        let summary = pipeline.run(meta(), valid_diff()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);

        pipeline.drain().await;
        // High-severity async findings are re-reported through audit.
        let reported = audit.events_of_type("ASYNC_VALIDATION_FAILURE").await;
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].metadata["code"], "ALWAYS_FAILS");
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "FailingSink"
        }

        async fn publish(&self, _ctx: &DiffContext) -> Result<(), BoxError> {
            Err("sink exploded".into())
        }
    }

    #[tokio::test]
    async fn sink_failure_is_routed_to_dlq_not_caller() {
        use crate::dlq::DlqConfig;
        use crate::store::MemoryStore;

        let audit = Arc::new(MemoryAuditRecorder::new());
        let dlq = Arc::new(DlqHandler::new(
            Arc::new(MemoryStore::new()),
            DlqConfig::new(SINK_DLQ_QUEUE),
        ));
        let pipeline = Arc::new(
            CommitHookPipeline::with_components(
                PipelineConfig::default(),
                Vec::new(),
                vec![Arc::new(FailingSink)],
                audit,
            )
            .with_dlq(dlq.clone()),
        );

        let summary = pipeline.run(meta(), valid_diff()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success, "sink failures stay invisible");
        pipeline.drain().await;

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.queues[SINK_DLQ_QUEUE].size, 1);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (pipeline, _, _) = pipeline();
        pipeline.initialize().await;
        pipeline.initialize().await;
        let summary = pipeline.run(meta(), valid_diff()).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        pipeline.drain().await;
    }
}
