//! Environment-driven configuration.

use crate::lock::LockManagerOptions;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Commit hook pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run validators detached instead of gating the commit.
    pub async_validation: bool,
    /// Serialized diff size limit in bytes.
    pub max_diff_size: usize,
    pub strict_validation: bool,
    pub strict_security: bool,
    pub enable_pii_validation: bool,
    pub schema_cache_ttl: Duration,
    pub validation_timeout: Duration,
    pub topic_prefix: String,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    pub audit_url: Option<String>,
    pub local_audit_file: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            async_validation: false,
            max_diff_size: 10 * 1024 * 1024,
            strict_validation: false,
            strict_security: false,
            enable_pii_validation: true,
            schema_cache_ttl: Duration::from_secs(300),
            validation_timeout: Duration::from_secs(30),
            topic_prefix: "terminus.commit".to_string(),
            webhook_url: None,
            webhook_timeout: Duration::from_secs(5),
            audit_url: None,
            local_audit_file: PathBuf::from("/var/log/portcullis-audit.log"),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            async_validation: env_bool("VALIDATION_ASYNC", defaults.async_validation),
            max_diff_size: env_u64("MAX_DIFF_SIZE_MB", 10) as usize * 1024 * 1024,
            strict_validation: env_bool("STRICT_VALIDATION", defaults.strict_validation),
            strict_security: env_bool("STRICT_SECURITY", defaults.strict_security),
            enable_pii_validation: env_bool(
                "ENABLE_PII_VALIDATION",
                defaults.enable_pii_validation,
            ),
            schema_cache_ttl: Duration::from_secs(env_u64("SCHEMA_CACHE_TTL_SECONDS", 300)),
            validation_timeout: Duration::from_secs(env_u64("VALIDATION_TIMEOUT_SECONDS", 30)),
            topic_prefix: env_string("COMMIT_TOPIC_PREFIX", &defaults.topic_prefix),
            webhook_url: std::env::var("COMMIT_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            webhook_timeout: Duration::from_secs(env_u64("WEBHOOK_TIMEOUT", 5)),
            audit_url: std::env::var("AUDIT_SERVICE_URL").ok().filter(|v| !v.is_empty()),
            local_audit_file: PathBuf::from(env_string(
                "LOCAL_AUDIT_FILE",
                "/var/log/portcullis-audit.log",
            )),
        }
    }
}

/// Lock manager configuration.
pub fn lock_options_from_env() -> LockManagerOptions {
    let defaults = LockManagerOptions::default();
    LockManagerOptions {
        cleanup_interval: Duration::from_secs(env_u64(
            "LOCK_CLEANUP_INTERVAL_S",
            defaults.cleanup_interval.as_secs(),
        )),
        cleanup_batch_size: env_u64(
            "LOCK_CLEANUP_BATCH_SIZE",
            defaults.cleanup_batch_size as u64,
        ) as usize,
        heartbeat_grace_multiplier: env_u64(
            "HEARTBEAT_GRACE_MULTIPLIER",
            defaults.heartbeat_grace_multiplier as u64,
        ) as u32,
        type_timeouts: HashMap::new(),
    }
}

/// Expected JSON type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    DateTime,
}

/// Declarative constraints for one document field.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    pub field_type: Option<FieldType>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub format: Option<FieldFormat>,
}

impl FieldSchema {
    pub fn string() -> Self {
        Self { field_type: Some(FieldType::String), ..Default::default() }
    }

    pub fn min(mut self, min_length: usize) -> Self {
        self.min_length = Some(min_length);
        self
    }

    pub fn max(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn datetime() -> Self {
        Self {
            field_type: Some(FieldType::String),
            format: Some(FieldFormat::DateTime),
            ..Default::default()
        }
    }

    pub fn of(field_type: FieldType) -> Self {
        Self { field_type: Some(field_type), ..Default::default() }
    }
}

/// Schema definition for one `@type`.
#[derive(Debug, Clone, Default)]
pub struct SchemaDef {
    pub required: Vec<String>,
    pub properties: HashMap<String, FieldSchema>,
}

/// Built-in schema definitions, with env-tunable length limits.
pub fn default_schemas() -> HashMap<String, SchemaDef> {
    let name_max = env_u64("SCHEMA_NAME_MAX_LENGTH", 100) as usize;
    let display_name_max = env_u64("SCHEMA_DISPLAY_NAME_MAX_LENGTH", 200) as usize;
    let description_max = env_u64("SCHEMA_DESCRIPTION_MAX_LENGTH", 1000) as usize;
    let branch_name_max = env_u64("BRANCH_NAME_MAX_LENGTH", 100) as usize;

    let mut schemas = HashMap::new();

    schemas.insert(
        "ObjectType".to_string(),
        SchemaDef {
            required: vec!["name".into(), "created_by".into(), "created_at".into()],
            properties: HashMap::from([
                ("name".to_string(), FieldSchema::string().min(1).max(name_max)),
                ("display_name".to_string(), FieldSchema::string().max(display_name_max)),
                ("description".to_string(), FieldSchema::string().max(description_max)),
                ("created_by".to_string(), FieldSchema::string().min(1)),
                ("created_at".to_string(), FieldSchema::datetime()),
                ("modified_by".to_string(), FieldSchema::string()),
                ("modified_at".to_string(), FieldSchema::datetime()),
                ("properties".to_string(), FieldSchema::of(FieldType::Array)),
            ]),
        },
    );

    schemas.insert(
        "Branch".to_string(),
        SchemaDef {
            required: vec!["name".into(), "created_by".into(), "created_at".into()],
            properties: HashMap::from([
                (
                    "name".to_string(),
                    FieldSchema::string().pattern("^[a-zA-Z0-9_/-]+$").max(branch_name_max),
                ),
                ("parent_branch".to_string(), FieldSchema::string()),
                ("created_by".to_string(), FieldSchema::string().min(1)),
                ("created_at".to_string(), FieldSchema::datetime()),
                ("is_protected".to_string(), FieldSchema::of(FieldType::Boolean)),
                ("is_active".to_string(), FieldSchema::of(FieldType::Boolean)),
                ("description".to_string(), FieldSchema::string().max(description_max)),
            ]),
        },
    );

    schemas.insert(
        "ValidationRule".to_string(),
        SchemaDef {
            required: vec!["name".into(), "rule_type".into(), "condition".into()],
            properties: HashMap::from([
                ("name".to_string(), FieldSchema::string().min(1).max(name_max)),
                (
                    "rule_type".to_string(),
                    FieldSchema::string().one_of(&["schema", "business", "security"]),
                ),
                ("condition".to_string(), FieldSchema::of(FieldType::Object)),
                (
                    "severity".to_string(),
                    FieldSchema::string().one_of(&["error", "warning", "info"]),
                ),
                ("enabled".to_string(), FieldSchema::of(FieldType::Boolean)),
            ]),
        },
    );

    schemas.insert(
        "AuditEvent".to_string(),
        SchemaDef {
            required: vec!["event_type".into(), "user_id".into(), "timestamp".into()],
            properties: HashMap::from([
                ("event_type".to_string(), FieldSchema::string().min(1)),
                ("event_category".to_string(), FieldSchema::string()),
                ("user_id".to_string(), FieldSchema::string().min(1)),
                ("username".to_string(), FieldSchema::string()),
                ("timestamp".to_string(), FieldSchema::datetime()),
                (
                    "severity".to_string(),
                    FieldSchema::string().one_of(&["INFO", "WARNING", "ERROR", "CRITICAL"]),
                ),
                ("metadata".to_string(), FieldSchema::of(FieldType::Object)),
            ]),
        },
    );

    schemas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = PipelineConfig::default();
        assert!(!config.async_validation);
        assert_eq!(config.max_diff_size, 10 * 1024 * 1024);
        assert_eq!(config.validation_timeout, Duration::from_secs(30));
        assert_eq!(config.webhook_timeout, Duration::from_secs(5));
        assert_eq!(config.topic_prefix, "terminus.commit");
    }

    #[test]
    fn default_schemas_cover_core_types() {
        let schemas = default_schemas();
        for doc_type in ["ObjectType", "Branch", "ValidationRule", "AuditEvent"] {
            assert!(schemas.contains_key(doc_type), "missing schema for {doc_type}");
        }
        let object_type = &schemas["ObjectType"];
        assert!(object_type.required.contains(&"created_by".to_string()));
        assert_eq!(object_type.properties["name"].max_length, Some(100));
    }

    #[test]
    fn lock_options_have_sane_defaults() {
        let options = lock_options_from_env();
        assert_eq!(options.cleanup_interval, Duration::from_secs(300));
        assert_eq!(options.cleanup_batch_size, 100);
        assert_eq!(options.heartbeat_grace_multiplier, 3);
    }
}
