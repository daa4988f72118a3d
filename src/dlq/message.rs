//! Dead-letter message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Why a message landed in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    ValidationFailed,
    ExecutionFailed,
    Timeout,
    ResourceExhausted,
    WebhookFailed,
    MaxRetriesExceeded,
    PoisonMessage,
    NetworkError,
    AuthError,
    Unknown,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::ValidationFailed => "validation_failed",
            DlqReason::ExecutionFailed => "execution_failed",
            DlqReason::Timeout => "timeout",
            DlqReason::ResourceExhausted => "resource_exhausted",
            DlqReason::WebhookFailed => "webhook_failed",
            DlqReason::MaxRetriesExceeded => "max_retries_exceeded",
            DlqReason::PoisonMessage => "poison_message",
            DlqReason::NetworkError => "network_error",
            DlqReason::AuthError => "auth_error",
            DlqReason::Unknown => "unknown",
        }
    }
}

/// Lifecycle position of a DLQ message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Retrying,
    Failed,
    Poison,
    Expired,
    Succeeded,
}

impl MessageStatus {
    /// Terminal statuses are never retried again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Poison | MessageStatus::Expired | MessageStatus::Succeeded)
    }
}

/// One entry in a message's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub error: String,
    pub retry_count: u32,
}

/// A failed message parked for retry or manual intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqMessage {
    pub message_id: String,
    pub queue_name: String,
    pub original_message: Value,
    pub reason: DlqReason,
    pub error_details: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub first_failure_time: DateTime<Utc>,
    pub last_failure_time: DateTime<Utc>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
}

impl DlqMessage {
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries && !self.status.is_terminal()
    }

    /// Record a failure in the history and update `error_details`.
    pub fn record_error(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        let error = error.into();
        self.error_details = error.clone();
        self.error_history.push(ErrorRecord { at, error, retry_count: self.retry_count });
    }
}

type TransformFn = Arc<dyn Fn(&DlqMessage) -> Value + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&DlqMessage) + Send + Sync>;

/// Per-queue DLQ configuration.
#[derive(Clone)]
pub struct DlqConfig {
    pub name: String,
    pub max_retries: u32,
    pub ttl: Duration,
    pub poison_threshold: u32,
    pub batch_size: usize,
    pub processing_timeout: Duration,
    pub poll_interval: Duration,
    pub key_prefix: String,
    /// Rewrites the payload before it is handed back to the handler.
    pub transform: Option<TransformFn>,
    pub success_callback: Option<MessageCallback>,
    pub failure_callback: Option<MessageCallback>,
}

impl std::fmt::Debug for DlqConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqConfig")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("ttl", &self.ttl)
            .field("poison_threshold", &self.poison_threshold)
            .field("batch_size", &self.batch_size)
            .field("processing_timeout", &self.processing_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl DlqConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_retries: 3,
            ttl: Duration::from_secs(24 * 60 * 60),
            poison_threshold: 5,
            batch_size: 100,
            processing_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            key_prefix: "dlq".to_string(),
            transform: None,
            success_callback: None,
            failure_callback: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&DlqMessage) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&DlqMessage) + Send + Sync + 'static,
    {
        self.success_callback = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&DlqMessage) + Send + Sync + 'static,
    {
        self.failure_callback = Some(Arc::new(f));
        self
    }
}
