//! Commit validators: synchronous gates that can reject a commit.

use super::context::DiffContext;
use crate::audit::{AuditEvent, AuditRecorder, AuditSeverity};
use crate::config::{default_schemas, FieldFormat, FieldSchema, FieldType, SchemaDef};
use crate::error::BoxError;
use crate::validation::{
    RuleContext, RuleEngine, Severity, ValidationCache, ValidationCategory, ValidationError,
    ValidationLevel, ValidationScope,
};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Raised by a validator to reject a commit.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("validation failed with {} errors", errors.len())]
pub struct ValidationFailure {
    pub errors: Vec<ValidationError>,
}

impl ValidationFailure {
    pub fn new(errors: Vec<ValidationError>) -> Self {
        Self { errors }
    }

    pub fn single(error: ValidationError) -> Self {
        Self { errors: vec![error] }
    }
}

/// A synchronous commit gate. Implementations must be idempotent and free
/// of observable side effects beyond telemetry.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn validate(&self, ctx: &DiffContext) -> Result<(), ValidationFailure>;

    async fn cleanup(&self) {}
}

/// Emit a `VALIDATION_BYPASS` audit event for a lax-mode pass-through.
pub(crate) async fn audit_bypass(
    audit: &Arc<dyn AuditRecorder>,
    bypass_type: &str,
    detail: &str,
    ctx: &DiffContext,
) {
    let event = AuditEvent::new("VALIDATION_BYPASS", "SECURITY")
        .severity(AuditSeverity::Critical)
        .user(ctx.meta.author.clone(), ctx.meta.author.clone())
        .target("DOCUMENT", ctx.meta.commit_id.clone().unwrap_or_else(|| "unknown".into()))
        .operation("BYPASS")
        .branch(ctx.meta.branch.clone())
        .request_id(ctx.meta.trace_id.clone())
        .meta("bypass_type", json!(bypass_type))
        .meta("detail", json!(detail));
    if let Err(e) = audit.record(event).await {
        tracing::error!(bypass_type, error = %e, "failed to audit validation bypass");
    }
}

const PROTECTED_FIELDS: [&str; 4] = ["created_by", "created_at", "_id", "_rev"];

/// Detects protected-field modification and injection-shaped payloads.
pub struct TamperValidator {
    strict_security: bool,
    audit: Arc<dyn AuditRecorder>,
    suspicious: Vec<(&'static str, Regex)>,
}

impl TamperValidator {
    pub fn new(strict_security: bool, audit: Arc<dyn AuditRecorder>) -> Self {
        let suspicious = vec![
            ("script_injection", Regex::new(r"(?i)<script[^>]*>").expect("script regex")),
            ("sql_injection", Regex::new(r"(?i)'\s*;\s*drop\s+table").expect("sql regex")),
            ("prototype_pollution", Regex::new(r"__proto__").expect("proto regex")),
            ("path_traversal", Regex::new(r"\.\./\.\./").expect("traversal regex")),
        ];
        Self { strict_security, audit, suspicious }
    }
}

#[async_trait]
impl Validator for TamperValidator {
    fn name(&self) -> &str {
        "TamperValidator"
    }

    async fn validate(&self, ctx: &DiffContext) -> Result<(), ValidationFailure> {
        if let (Some(before), Some(after)) = (&ctx.before, &ctx.after) {
            if !ctx.meta.author.starts_with("system@") {
                for field in PROTECTED_FIELDS {
                    let (Some(old), Some(new)) = (before.get(field), after.get(field)) else {
                        continue;
                    };
                    if old != new {
                        return Err(ValidationFailure::single(
                            ValidationError::new(
                                field,
                                "PROTECTED_FIELD_MODIFIED",
                                format!("attempt to modify protected field '{field}'"),
                                ValidationCategory::Security,
                                Severity::Critical,
                            )
                            .with_context("author", json!(ctx.meta.author)),
                        ));
                    }
                }
            }
        }

        let diff_text = ctx.diff.to_string();
        for (pattern_name, regex) in &self.suspicious {
            if !regex.is_match(&diff_text) {
                continue;
            }
            if self.strict_security {
                return Err(ValidationFailure::single(ValidationError::new(
                    "diff",
                    "SUSPICIOUS_PATTERN",
                    format!("suspicious pattern detected: {pattern_name}"),
                    ValidationCategory::Security,
                    Severity::Critical,
                )));
            }
            tracing::error!(
                security_event = "SECURITY_BYPASS",
                pattern = pattern_name,
                author = %ctx.meta.author,
                branch = %ctx.meta.branch,
                "suspicious pattern detected but not blocked in non-strict mode"
            );
            audit_bypass(
                &self.audit,
                "security_validation",
                &format!("suspicious pattern: {pattern_name}"),
                ctx,
            )
            .await;
        }
        Ok(())
    }
}

const RESERVED_NAME_PREFIXES: [&str; 4] = ["sys:", "woql:", "rdf:", "owl:"];
const PROTECTED_BRANCH_DOCS: [&str; 4] = ["main", "master", "production", "staging"];

/// Validates documents against the configured schema definitions plus the
/// domain business rules.
pub struct SchemaValidator {
    schemas: HashMap<String, SchemaDef>,
    pascal_case: Regex,
    branch_name: Regex,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(default_schemas())
    }
}

impl SchemaValidator {
    pub fn new(schemas: HashMap<String, SchemaDef>) -> Self {
        Self {
            schemas,
            pascal_case: Regex::new(r"^[A-Z][a-zA-Z0-9_]*$").expect("pascal regex"),
            branch_name: Regex::new(r"^[a-z0-9/_-]+$").expect("branch regex"),
        }
    }

    fn check_field(
        &self,
        field: &str,
        value: &Value,
        schema: &FieldSchema,
        errors: &mut Vec<ValidationError>,
    ) {
        let mut err = |code: &str, message: String| {
            errors.push(ValidationError::new(
                field,
                code,
                message,
                ValidationCategory::Syntax,
                Severity::High,
            ));
        };

        if let Some(expected) = schema.field_type {
            let matches = match expected {
                FieldType::String => value.is_string(),
                FieldType::Number => value.is_number(),
                FieldType::Boolean => value.is_boolean(),
                FieldType::Array => value.is_array(),
                FieldType::Object => value.is_object(),
            };
            if !matches {
                err("INVALID_TYPE", format!("field '{field}' has wrong type"));
                return;
            }
        }

        let Some(text) = value.as_str() else { return };
        if let Some(min) = schema.min_length {
            if text.len() < min {
                err("TOO_SHORT", format!("field '{field}' must be at least {min} characters"));
            }
        }
        if let Some(max) = schema.max_length {
            if text.len() > max {
                err("TOO_LONG", format!("field '{field}' must be at most {max} characters"));
            }
        }
        if let Some(pattern) = &schema.pattern {
            if let Ok(regex) = Regex::new(pattern) {
                if !regex.is_match(text) {
                    err("PATTERN_MISMATCH", format!("field '{field}' does not match required pattern"));
                }
            }
        }
        if let Some(allowed) = &schema.enum_values {
            if !allowed.iter().any(|v| v == text) {
                err("INVALID_ENUM", format!("field '{field}' must be one of {allowed:?}"));
            }
        }
        if schema.format == Some(FieldFormat::DateTime)
            && chrono::DateTime::parse_from_rfc3339(text).is_err()
        {
            err("INVALID_DATETIME", format!("field '{field}' must be a valid ISO datetime"));
        }
    }

    fn business_rules(&self, document: &Value, doc_type: &str, errors: &mut Vec<ValidationError>) {
        let name = document.get("name").and_then(Value::as_str).unwrap_or("");
        match doc_type {
            "ObjectType" => {
                if RESERVED_NAME_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                    errors.push(ValidationError::new(
                        "name",
                        "RESERVED_PREFIX",
                        format!("ObjectType name cannot start with a reserved prefix: {name}"),
                        ValidationCategory::Business,
                        Severity::High,
                    ));
                } else if !name.is_empty() && !self.pascal_case.is_match(name) {
                    errors.push(
                        ValidationError::new(
                            "name",
                            "NAMING_CONVENTION",
                            format!("ObjectType name must be PascalCase: {name}"),
                            ValidationCategory::Business,
                            Severity::High,
                        )
                        .with_fix("rename to PascalCase, e.g. InvoiceLine"),
                    );
                }
            }
            "Branch" => {
                if PROTECTED_BRANCH_DOCS.contains(&name)
                    && !document.get("is_protected").and_then(Value::as_bool).unwrap_or(false)
                {
                    errors.push(ValidationError::new(
                        "is_protected",
                        "UNPROTECTED_BRANCH",
                        format!("branch '{name}' must be marked as protected"),
                        ValidationCategory::Business,
                        Severity::High,
                    ));
                }
                if !name.is_empty() && !self.branch_name.is_match(name) {
                    errors.push(ValidationError::new(
                        "name",
                        "NAMING_CONVENTION",
                        format!("branch name must use lowercase with hyphens/underscores: {name}"),
                        ValidationCategory::Business,
                        Severity::High,
                    ));
                }
            }
            "ValidationRule" => {
                let rule_type = document.get("rule_type").and_then(Value::as_str).unwrap_or("");
                let condition = document.get("condition");
                let missing = |key: &str| {
                    condition.and_then(|c| c.get(key)).is_none()
                };
                if rule_type == "schema" && missing("schema_path") {
                    errors.push(ValidationError::new(
                        "condition",
                        "MISSING_CONDITION_FIELD",
                        "schema validation rule must have 'schema_path' in condition",
                        ValidationCategory::Semantic,
                        Severity::High,
                    ));
                } else if rule_type == "business" && missing("expression") {
                    errors.push(ValidationError::new(
                        "condition",
                        "MISSING_CONDITION_FIELD",
                        "business validation rule must have 'expression' in condition",
                        ValidationCategory::Semantic,
                        Severity::High,
                    ));
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    fn name(&self) -> &str {
        "SchemaValidator"
    }

    async fn validate(&self, ctx: &DiffContext) -> Result<(), ValidationFailure> {
        let Some(after) = &ctx.after else { return Ok(()) };
        let Some(doc_type) = after.get("@type").and_then(Value::as_str) else {
            tracing::debug!("no @type field, skipping schema validation");
            return Ok(());
        };
        let Some(object) = after.as_object() else { return Ok(()) };

        let mut errors = Vec::new();
        if let Some(schema) = self.schemas.get(doc_type) {
            for field in &schema.required {
                if !object.contains_key(field) {
                    errors.push(ValidationError::new(
                        field,
                        "MISSING_REQUIRED_FIELD",
                        format!("missing required field for {doc_type}: {field}"),
                        ValidationCategory::Semantic,
                        Severity::High,
                    ));
                }
            }
            for (field, value) in object {
                if field.starts_with('@') {
                    continue;
                }
                if let Some(field_schema) = schema.properties.get(field) {
                    self.check_field(field, value, field_schema, &mut errors);
                }
            }
        }
        self.business_rules(after, doc_type, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::new(errors))
        }
    }
}

/// Scans string fields for personally identifiable information.
pub struct PiiValidator {
    enabled: bool,
    patterns: Vec<(&'static str, Regex)>,
    allowed_fields: Vec<&'static str>,
}

impl PiiValidator {
    pub fn new(enabled: bool) -> Self {
        let patterns = vec![
            ("ssn", Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex")),
            (
                "credit_card",
                Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").expect("cc regex"),
            ),
            (
                "email",
                Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
                    .expect("email regex"),
            ),
            ("phone", Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").expect("phone regex")),
        ];
        Self {
            enabled,
            patterns,
            allowed_fields: vec!["email", "contact_email", "user_email", "owner_email"],
        }
    }

    fn scan(&self, value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path =
                        if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                    self.scan(child, &child_path, errors);
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.scan(item, &format!("{path}[{i}]"), errors);
                }
            }
            Value::String(text) => {
                let field_name = path.rsplit('.').next().unwrap_or(path);
                let field_name = field_name.split('[').next().unwrap_or(field_name);
                if self.allowed_fields.contains(&field_name) {
                    return;
                }
                for (pii_type, regex) in &self.patterns {
                    if regex.is_match(text) {
                        errors.push(ValidationError::new(
                            path,
                            "PII_DETECTED",
                            format!("potential {pii_type} detected in non-allowed field"),
                            ValidationCategory::Security,
                            Severity::High,
                        ));
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Validator for PiiValidator {
    fn name(&self) -> &str {
        "PIIValidator"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn validate(&self, ctx: &DiffContext) -> Result<(), ValidationFailure> {
        let Some(after) = &ctx.after else { return Ok(()) };
        let mut errors = Vec::new();
        self.scan(after, "", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure::new(errors))
        }
    }
}

/// Delegates to the pluggable rule engine; engine failures block in strict
/// mode and become auditable bypasses otherwise. Results are cached by
/// document hash so repeated commits of the same payload skip the engine.
pub struct RuleValidator {
    engine: Arc<dyn RuleEngine>,
    strict_validation: bool,
    audit: Arc<dyn AuditRecorder>,
    cache: ValidationCache,
}

impl RuleValidator {
    pub fn new(
        engine: Arc<dyn RuleEngine>,
        strict_validation: bool,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        Self::with_cache_ttl(engine, strict_validation, audit, std::time::Duration::from_secs(300))
    }

    pub fn with_cache_ttl(
        engine: Arc<dyn RuleEngine>,
        strict_validation: bool,
        audit: Arc<dyn AuditRecorder>,
        cache_ttl: std::time::Duration,
    ) -> Self {
        Self { engine, strict_validation, audit, cache: ValidationCache::new(cache_ttl, 10_000) }
    }

    fn failure_from(result: crate::validation::ValidationResult) -> Result<(), ValidationFailure> {
        if result.is_valid {
            Ok(())
        } else {
            Err(ValidationFailure::new(result.errors))
        }
    }
}

#[async_trait]
impl Validator for RuleValidator {
    fn name(&self) -> &str {
        "RuleValidator"
    }

    async fn validate(&self, ctx: &DiffContext) -> Result<(), ValidationFailure> {
        let Some(after) = &ctx.after else { return Ok(()) };

        let cache_key =
            ValidationCache::key(after, ValidationLevel::Standard, ValidationScope::Schema);
        if let Some(cached) = self.cache.get(cache_key) {
            return Self::failure_from(cached);
        }

        let rule_ctx = RuleContext::from([
            ("user".to_string(), ctx.meta.author.clone()),
            ("branch".to_string(), ctx.meta.branch.clone()),
            ("trace_id".to_string(), ctx.meta.trace_id.clone()),
        ]);

        match self.engine.evaluate(after, ValidationLevel::Standard, &rule_ctx).await {
            Ok(result) => {
                self.cache.put(cache_key, result.clone());
                Self::failure_from(result)
            }
            Err(e) => {
                if self.strict_validation {
                    return Err(ValidationFailure::single(ValidationError::new(
                        "__rule_engine__",
                        "RULE_ENGINE_ERROR",
                        e.to_string(),
                        ValidationCategory::Business,
                        Severity::High,
                    )));
                }
                tracing::error!(
                    security_event = "VALIDATION_BYPASS",
                    error = %e,
                    author = %ctx.meta.author,
                    branch = %ctx.meta.branch,
                    "rule validation error bypassed in non-strict mode"
                );
                audit_bypass(&self.audit, "rule_validation", &e.to_string(), ctx).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditRecorder;
    use crate::hook::context::CommitMeta;
    use crate::validation::{BasicRuleEngine, RuleEngineError, ValidationResult};
    use serde_json::json;

    fn ctx(author: &str, diff: Value) -> DiffContext {
        DiffContext::build(CommitMeta::new("oms", "dev/payments/schema-v3", author), diff)
            .unwrap()
    }

    #[tokio::test]
    async fn tamper_blocks_protected_field_changes() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = TamperValidator::new(false, audit);
        let diff = json!({
            "before": {"created_by": "bob", "name": "X"},
            "after": {"created_by": "mallory", "name": "X"},
        });
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert_eq!(err.errors[0].code, "PROTECTED_FIELD_MODIFIED");
    }

    #[tokio::test]
    async fn tamper_allows_system_authors() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = TamperValidator::new(false, audit);
        let diff = json!({
            "before": {"created_by": "bob"},
            "after": {"created_by": "carol"},
        });
        assert!(validator.validate(&ctx("system@oms", diff)).await.is_ok());
    }

    #[tokio::test]
    async fn suspicious_pattern_fails_in_strict_mode() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = TamperValidator::new(true, audit);
        let diff = json!({"payload": "<script>alert(1)</script>"});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert_eq!(err.errors[0].code, "SUSPICIOUS_PATTERN");
    }

    #[tokio::test]
    async fn suspicious_pattern_audits_in_lax_mode() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = TamperValidator::new(false, audit.clone());
        let diff = json!({"payload": "see ../../etc/passwd"});
        assert!(validator.validate(&ctx("alice@co", diff)).await.is_ok());

        let events = audit.events_of_type("VALIDATION_BYPASS").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, AuditSeverity::Critical);
        assert_eq!(events[0].metadata["bypass_type"], "security_validation");
    }

    #[tokio::test]
    async fn schema_checks_required_fields_and_constraints() {
        let validator = SchemaValidator::default();
        let diff = json!({"after": {
            "@type": "ObjectType",
            "name": "Invoice",
            "created_by": "alice",
            // created_at missing
        }});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert!(err.errors.iter().any(|e| e.code == "MISSING_REQUIRED_FIELD"));

        let diff = json!({"after": {
            "@type": "ObjectType",
            "name": "Invoice",
            "created_by": "alice",
            "created_at": "not-a-date",
        }});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert!(err.errors.iter().any(|e| e.code == "INVALID_DATETIME"));
    }

    #[tokio::test]
    async fn schema_accepts_valid_object_type() {
        let validator = SchemaValidator::default();
        let diff = json!({"after": {
            "@type": "ObjectType",
            "name": "Invoice",
            "created_by": "alice",
            "created_at": "2026-07-01T12:00:00Z",
            "properties": [],
        }});
        assert!(validator.validate(&ctx("alice@co", diff)).await.is_ok());
    }

    #[tokio::test]
    async fn schema_business_rules_cover_naming() {
        let validator = SchemaValidator::default();
        let diff = json!({"after": {
            "@type": "ObjectType",
            "name": "sys:Internal",
            "created_by": "alice",
            "created_at": "2026-07-01T12:00:00Z",
        }});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert!(err.errors.iter().any(|e| e.code == "RESERVED_PREFIX"));

        let diff = json!({"after": {
            "@type": "ObjectType",
            "name": "invoice_line",
            "created_by": "alice",
            "created_at": "2026-07-01T12:00:00Z",
        }});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert!(err.errors.iter().any(|e| e.code == "NAMING_CONVENTION"));
    }

    #[tokio::test]
    async fn schema_requires_protection_for_main() {
        let validator = SchemaValidator::default();
        let diff = json!({"after": {
            "@type": "Branch",
            "name": "main",
            "created_by": "alice",
            "created_at": "2026-07-01T12:00:00Z",
        }});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert!(err.errors.iter().any(|e| e.code == "UNPROTECTED_BRANCH"));

        let diff = json!({"after": {
            "@type": "Branch",
            "name": "main",
            "is_protected": true,
            "created_by": "alice",
            "created_at": "2026-07-01T12:00:00Z",
        }});
        assert!(validator.validate(&ctx("alice@co", diff)).await.is_ok());
    }

    #[tokio::test]
    async fn schema_skips_documents_without_type() {
        let validator = SchemaValidator::default();
        let diff = json!({"after": {"name": "whatever"}});
        assert!(validator.validate(&ctx("alice@co", diff)).await.is_ok());
    }

    #[tokio::test]
    async fn pii_flags_non_allowed_fields_only() {
        let validator = PiiValidator::new(true);
        let diff = json!({"after": {
            "contact_email": "alice@example.com",
            "notes": "call me at 555-123-4567",
            "nested": {"ssn": "123-45-6789"},
        }});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        let fields: Vec<&str> = err.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"notes"));
        assert!(fields.contains(&"nested.ssn"));
        assert!(!fields.iter().any(|f| f.contains("contact_email")));
    }

    #[tokio::test]
    async fn pii_disabled_reports_disabled() {
        let validator = PiiValidator::new(false);
        assert!(!validator.enabled());
    }

    #[tokio::test]
    async fn rule_validator_blocks_on_engine_findings() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = RuleValidator::new(Arc::new(BasicRuleEngine::new()), false, audit);
        let diff = json!({"after": {"@type": "ObjectType", "name": "Invoice"}});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert_eq!(err.errors[0].code, "MISSING_REQUIRED_FIELDS");
    }

    #[derive(Debug)]
    struct BrokenEngine;

    #[async_trait]
    impl RuleEngine for BrokenEngine {
        async fn evaluate(
            &self,
            _data: &Value,
            _level: ValidationLevel,
            _ctx: &RuleContext,
        ) -> Result<ValidationResult, RuleEngineError> {
            Err(RuleEngineError::Unavailable("rule db down".into()))
        }
    }

    #[tokio::test]
    async fn rule_engine_failure_is_bypassed_in_lax_mode() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = RuleValidator::new(Arc::new(BrokenEngine), false, audit.clone());
        let diff = json!({"after": {"@type": "ObjectType"}});
        assert!(validator.validate(&ctx("alice@co", diff)).await.is_ok());

        let events = audit.events_of_type("VALIDATION_BYPASS").await;
        assert_eq!(events[0].metadata["bypass_type"], "rule_validation");
    }

    #[derive(Debug, Default)]
    struct CountingEngine {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RuleEngine for CountingEngine {
        async fn evaluate(
            &self,
            _data: &Value,
            level: ValidationLevel,
            _ctx: &RuleContext,
        ) -> Result<ValidationResult, RuleEngineError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(ValidationResult::valid(level))
        }
    }

    #[tokio::test]
    async fn rule_results_are_cached_by_document() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let engine = Arc::new(CountingEngine::default());
        let validator = RuleValidator::new(engine.clone(), false, audit);

        let diff = json!({"after": {"@type": "ObjectType", "name": "Invoice", "@id": "Invoice"}});
        validator.validate(&ctx("alice@co", diff.clone())).await.unwrap();
        validator.validate(&ctx("alice@co", diff)).await.unwrap();
        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // A different document misses the cache.
        let other = json!({"after": {"@type": "ObjectType", "name": "Order", "@id": "Order"}});
        validator.validate(&ctx("alice@co", other)).await.unwrap();
        assert_eq!(engine.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rule_engine_failure_blocks_in_strict_mode() {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let validator = RuleValidator::new(Arc::new(BrokenEngine), true, audit);
        let diff = json!({"after": {"@type": "ObjectType"}});
        let err = validator.validate(&ctx("alice@co", diff)).await.unwrap_err();
        assert_eq!(err.errors[0].code, "RULE_ENGINE_ERROR");
    }
}
