//! Commit event sinks: asynchronous consumers that never block a commit.

use super::context::DiffContext;
use crate::audit::{AuditEvent, AuditRecorder, AuditSeverity};
use crate::bus::EventBus;
use crate::error::BoxError;
use crate::policies;
use crate::retry::RetryExecutor;
use crate::time::{SystemWallClock, WallClock};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// An asynchronous consumer of commit events. Failures are observed in
/// metrics (and the DLQ where attached) but never surface to the caller.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    /// Deadline for one publish attempt, enforced by the pipeline.
    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn initialize(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn publish(&self, ctx: &DiffContext) -> Result<(), BoxError>;

    async fn cleanup(&self) {}
}

/// Publishes structured commit events to `{prefix}.{env}.{service}`.
pub struct BusSink {
    bus: Arc<dyn EventBus>,
    topic_prefix: String,
    clock: Arc<dyn WallClock>,
}

impl BusSink {
    pub fn new(bus: Arc<dyn EventBus>, topic_prefix: impl Into<String>) -> Self {
        Self { bus, topic_prefix: topic_prefix.into(), clock: Arc::new(SystemWallClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Sink for BusSink {
    fn name(&self) -> &str {
        "BusSink"
    }

    async fn publish(&self, ctx: &DiffContext) -> Result<(), BoxError> {
        let path = ctx.branch_path();
        let topic = format!("{}.{}.{}", self.topic_prefix, path.env, path.service);
        let headers = HashMap::from([
            ("trace-id".to_string(), ctx.meta.trace_id.clone()),
            ("author".to_string(), ctx.meta.author.clone()),
            ("branch".to_string(), ctx.meta.branch.clone()),
        ]);
        let payload = json!({
            "type": "commit",
            "database": ctx.meta.database,
            "branch": ctx.meta.branch,
            "commit_id": ctx.meta.commit_id,
            "author": ctx.meta.author,
            "message": ctx.meta.commit_msg,
            "trace_id": ctx.meta.trace_id,
            "timestamp": self.clock.now_utc().to_rfc3339(),
            "diff": ctx.diff,
            "affected_types": ctx.affected_types,
            "affected_ids": ctx.affected_ids,
        });
        self.bus.publish(&topic, headers, payload).await?;
        tracing::debug!(topic, "commit event published");
        Ok(())
    }
}

/// Records one canonical audit event per commit.
pub struct AuditEventSink {
    audit: Arc<dyn AuditRecorder>,
}

impl AuditEventSink {
    pub fn new(audit: Arc<dyn AuditRecorder>) -> Self {
        Self { audit }
    }

    /// CREATE/UPDATE/DELETE derived from snapshot presence, WRITE when
    /// neither snapshot is carried.
    fn operation(ctx: &DiffContext) -> &'static str {
        match (&ctx.before, &ctx.after) {
            (Some(_), None) => "DELETE",
            (None, Some(_)) => "CREATE",
            (Some(_), Some(_)) => "UPDATE",
            (None, None) => "WRITE",
        }
    }
}

#[async_trait]
impl Sink for AuditEventSink {
    fn name(&self) -> &str {
        "AuditSink"
    }

    async fn publish(&self, ctx: &DiffContext) -> Result<(), BoxError> {
        let user_id = ctx.meta.author.split('@').next().unwrap_or(&ctx.meta.author);
        let mut event = AuditEvent::new("DATA_COMMIT", "DATA_MANAGEMENT")
            .severity(AuditSeverity::Info)
            .user(user_id, ctx.meta.author.clone())
            .target(
                "DOCUMENT",
                ctx.meta.commit_id.clone().unwrap_or_else(|| "unknown".to_string()),
            )
            .operation(Self::operation(ctx))
            .branch(ctx.meta.branch.clone())
            .request_id(ctx.meta.trace_id.clone())
            .meta("commit_message", json!(ctx.meta.commit_msg))
            .meta("affected_types", json!(ctx.affected_types))
            .meta("affected_ids", json!(ctx.affected_ids))
            .meta("source", json!("commit_hook"));
        event.commit_id = ctx.meta.commit_id.clone();
        event.terminus_db = Some(ctx.meta.database.clone());
        self.audit.record(event).await?;
        Ok(())
    }
}

/// Delivers commit notifications over HTTP, with retries.
pub struct WebhookSink {
    url: Option<String>,
    client: reqwest::Client,
    executor: RetryExecutor<BoxError>,
    request_timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: Option<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { url, client, executor: RetryExecutor::new(), request_timeout }
    }

    pub fn with_executor(mut self, executor: RetryExecutor<BoxError>) -> Self {
        self.executor = executor;
        self
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "WebhookSink"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    fn timeout(&self) -> Duration {
        // Covers the in-band retry envelope, not a single request.
        self.request_timeout * 4 + Duration::from_secs(15)
    }

    async fn publish(&self, ctx: &DiffContext) -> Result<(), BoxError> {
        let Some(url) = &self.url else { return Ok(()) };

        let payload = json!({
            "event": "terminus.commit",
            "database": ctx.meta.database,
            "branch": ctx.meta.branch,
            "commit": {
                "id": ctx.meta.commit_id,
                "author": ctx.meta.author,
                "message": ctx.meta.commit_msg,
                "timestamp": ctx.meta.timestamp.to_rfc3339(),
            },
            "summary": {
                "affected_types": ctx.affected_types,
                "affected_ids": ctx.affected_ids,
                "changes": ctx.diff.as_object().map_or(0, |o| o.len()),
            },
        });

        let config = policies::NETWORK.to_config::<BoxError>();
        let outcome = self
            .executor
            .execute(
                || {
                    let request = self
                        .client
                        .post(url)
                        .json(&payload)
                        .header("X-Trace-ID", ctx.meta.trace_id.clone())
                        .header("X-Event-Type", "terminus.commit");
                    async move {
                        let response = request.send().await.map_err(|e| BoxError::from(e))?;
                        if response.status().is_success() {
                            Ok(())
                        } else {
                            Err(BoxError::from(format!(
                                "webhook returned {}",
                                response.status()
                            )))
                        }
                    }
                },
                &config,
            )
            .await;

        match outcome {
            Ok(_) => {
                tracing::debug!(url, "webhook delivered");
                Ok(())
            }
            Err(e) => Err(BoxError::from(e.to_string())),
        }
    }
}

/// Increments commit counters and observes diff sizes.
pub struct MetricsSink;

#[async_trait]
impl Sink for MetricsSink {
    fn name(&self) -> &str {
        "MetricsSink"
    }

    async fn publish(&self, ctx: &DiffContext) -> Result<(), BoxError> {
        let path = ctx.branch_path();
        let branch_label = format!("{}/{}", path.env, path.service);
        counter!(
            "terminus_commits_total",
            "database" => ctx.meta.database.clone(),
            "branch" => branch_label.clone(),
            "author_domain" => ctx.meta.author_domain().to_string()
        )
        .increment(1);
        histogram!(
            "terminus_commit_size_bytes",
            "database" => ctx.meta.database.clone(),
            "branch" => branch_label
        )
        .record(ctx.diff_size() as f64);
        Ok(())
    }
}
