//! Audit service boundary.
//!
//! Canonical audit events are submitted to the audit service over HTTP;
//! when the service is unreachable they land in a local append-only JSONL
//! file so security-relevant records are never dropped silently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit submission failed: {0}")]
    Submission(String),
    #[error("audit fallback write failed: {0}")]
    Fallback(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Canonical audit event shape shared with the audit service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub event_category: String,
    pub severity: AuditSeverity,
    pub user_id: String,
    pub username: String,
    pub target_type: String,
    pub target_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminus_db: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, event_category: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            event_category: event_category.into(),
            severity: AuditSeverity::Info,
            user_id: String::new(),
            username: String::new(),
            target_type: String::new(),
            target_id: String::new(),
            operation: String::new(),
            branch: None,
            commit_id: None,
            terminus_db: None,
            request_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>, username: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.username = username.into();
        self
    }

    pub fn target(mut self, target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.target_type = target_type.into();
        self.target_id = target_id.into();
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[async_trait]
pub trait AuditRecorder: Send + Sync + std::fmt::Debug {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Submits events to `{base_url}/api/v2/events`, falling back to a local
/// JSONL file when the service cannot be reached.
#[derive(Debug)]
pub struct HttpAuditRecorder {
    client: reqwest::Client,
    base_url: String,
    fallback_file: PathBuf,
}

impl HttpAuditRecorder {
    pub fn new(base_url: impl Into<String>, fallback_file: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.into(), fallback_file: fallback_file.into() }
    }

    async fn write_fallback(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(event)
            .map_err(|e| AuditError::Submission(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl AuditRecorder for HttpAuditRecorder {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let url = format!("{}/api/v2/events", self.base_url);
        let response = self.client.post(&url).json(&event).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "audit service rejected event, using fallback file");
                self.write_fallback(&event).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "audit service unreachable, using fallback file");
                self.write_fallback(&event).await
            }
        }
    }
}

/// In-memory recorder for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditRecorder {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditRecorder for MemoryAuditRecorder {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.write().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_fills_fields() {
        let event = AuditEvent::new("DATA_COMMIT", "DATA_MANAGEMENT")
            .severity(AuditSeverity::Critical)
            .user("alice", "alice@co")
            .target("DOCUMENT", "c-1")
            .operation("CREATE")
            .branch("dev/payments/schema-v3")
            .request_id("t-1")
            .meta("source", json!("hook"));
        assert_eq!(event.severity, AuditSeverity::Critical);
        assert_eq!(event.branch.as_deref(), Some("dev/payments/schema-v3"));
        assert_eq!(event.metadata["source"], "hook");
    }

    #[test]
    fn severity_serializes_uppercase() {
        let json = serde_json::to_value(AuditSeverity::Critical).unwrap();
        assert_eq!(json, "CRITICAL");
    }

    #[tokio::test]
    async fn memory_recorder_filters_by_type() {
        let recorder = MemoryAuditRecorder::new();
        recorder.record(AuditEvent::new("A", "SECURITY")).await.unwrap();
        recorder.record(AuditEvent::new("B", "SECURITY")).await.unwrap();
        recorder.record(AuditEvent::new("A", "SECURITY")).await.unwrap();
        assert_eq!(recorder.events_of_type("A").await.len(), 2);
        assert_eq!(recorder.events().await.len(), 3);
    }

    #[tokio::test]
    async fn http_recorder_falls_back_to_file() {
        let dir = std::env::temp_dir().join(format!("portcullis-audit-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("audit.jsonl");
        // Port 9 (discard) refuses connections; the event must land on disk.
        let recorder = HttpAuditRecorder::new("http://127.0.0.1:9", &path);
        recorder
            .record(AuditEvent::new("VALIDATION_BYPASS", "SECURITY"))
            .await
            .unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("VALIDATION_BYPASS"));
    }
}
