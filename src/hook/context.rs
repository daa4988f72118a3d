//! Commit metadata and the per-run diff context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("branch must be a three-segment env/service/purpose path, got {0:?}")]
pub struct BranchPathError(pub String);

/// Parsed `{env}/{service}/{purpose}` branch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPath {
    pub env: String,
    pub service: String,
    pub purpose: String,
}

impl BranchPath {
    pub fn parse(branch: &str) -> Result<Self, BranchPathError> {
        let mut parts = branch.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(env), Some(service), Some(purpose))
                if !env.is_empty() && !service.is_empty() && !purpose.is_empty() =>
            {
                Ok(Self {
                    env: env.to_string(),
                    service: service.to_string(),
                    purpose: purpose.to_string(),
                })
            }
            _ => Err(BranchPathError(branch.to_string())),
        }
    }
}

/// Immutable description of an intended commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMeta {
    pub database: String,
    pub branch: String,
    pub commit_id: Option<String>,
    pub author: String,
    pub commit_msg: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitMeta {
    pub fn new(
        database: impl Into<String>,
        branch: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            branch: branch.into(),
            commit_id: None,
            author: author.into(),
            commit_msg: String::new(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn commit_id(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = Some(commit_id.into());
        self
    }

    pub fn message(mut self, commit_msg: impl Into<String>) -> Self {
        self.commit_msg = commit_msg.into();
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Domain part of the author identity, for metric labels.
    pub fn author_domain(&self) -> &str {
        self.author.split_once('@').map(|(_, domain)| domain).unwrap_or("unknown")
    }
}

/// Pipeline-scoped view of one commit: metadata, raw diff, optional
/// snapshots, and the affected type/id sets derived at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffContext {
    pub meta: CommitMeta,
    pub diff: Value,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub affected_types: Vec<String>,
    pub affected_ids: Vec<String>,
}

impl DiffContext {
    /// Build the context, validating the branch path and walking the diff
    /// for `@type`/`@id` occurrences.
    pub fn build(meta: CommitMeta, diff: Value) -> Result<Self, BranchPathError> {
        BranchPath::parse(&meta.branch)?;

        let before = diff.get("before").filter(|v| !v.is_null()).cloned();
        let after = diff.get("after").filter(|v| !v.is_null()).cloned();

        let mut affected_types = BTreeSet::new();
        let mut affected_ids = BTreeSet::new();
        collect_annotations(&diff, &mut affected_types, &mut affected_ids);

        Ok(Self {
            meta,
            diff,
            before,
            after,
            affected_types: affected_types.into_iter().collect(),
            affected_ids: affected_ids.into_iter().collect(),
        })
    }

    pub fn branch_path(&self) -> BranchPath {
        // Validated in build; a stored meta cannot regress.
        BranchPath::parse(&self.meta.branch).expect("branch path validated at build")
    }

    /// Serialized size of the diff in bytes.
    pub fn diff_size(&self) -> usize {
        serde_json::to_string(&self.diff).map(|s| s.len()).unwrap_or(0)
    }
}

fn collect_annotations(
    value: &Value,
    types: &mut BTreeSet<String>,
    ids: &mut BTreeSet<String>,
) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(t)) = map.get("@type") {
                types.insert(t.clone());
            }
            if let Some(Value::String(id)) = map.get("@id") {
                ids.insert(id.clone());
            }
            for child in map.values() {
                collect_annotations(child, types, ids);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_annotations(item, types, ids);
            }
        }
        _ => {}
    }
}
