//! Shared validation contracts.
//!
//! The structured error/result model consumed by the hook pipeline, plus
//! the pluggable rule engine the rule validator delegates to. The full
//! enterprise validation service lives outside this crate; the in-crate
//! engine covers the fallback rules so the pipeline works stand-alone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::time::{SystemWallClock, WallClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Minimal,
    Standard,
    Strict,
    Paranoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationScope {
    Request,
    Response,
    Schema,
    Data,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    Syntax,
    Semantic,
    Security,
    Business,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn blocks_commit(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// One structured validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub code: String,
    pub message: String,
    pub category: ValidationCategory,
    pub severity: Severity,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        category: ValidationCategory,
        severity: Severity,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
            category,
            severity,
            context: HashMap::new(),
            suggested_fix: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

/// Security score floor below which a result is invalid even without
/// blocking errors.
pub const SECURITY_SCORE_THRESHOLD: u8 = 70;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub request_id: String,
    pub is_valid: bool,
    pub level: ValidationLevel,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_data: Option<Value>,
    pub security_score: u8,
    pub performance_impact_ms: f64,
    pub cache_used: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ValidationResult {
    /// Assemble a result, enforcing
    /// `is_valid ↔ errors.is_empty() ∧ security_score ≥ threshold`.
    pub fn assemble(
        level: ValidationLevel,
        errors: Vec<ValidationError>,
        warnings: Vec<ValidationError>,
        security_score: u8,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            is_valid: errors.is_empty() && security_score >= SECURITY_SCORE_THRESHOLD,
            level,
            errors,
            warnings,
            sanitized_data: None,
            security_score,
            performance_impact_ms: 0.0,
            cache_used: false,
            metadata: HashMap::new(),
        }
    }

    pub fn valid(level: ValidationLevel) -> Self {
        Self::assemble(level, Vec::new(), Vec::new(), 100)
    }
}

#[derive(Debug, Error)]
pub enum RuleEngineError {
    #[error("rule engine unavailable: {0}")]
    Unavailable(String),
    #[error("rule {rule_id} failed: {reason}")]
    RuleFailed { rule_id: String, reason: String },
}

/// Evaluation context handed to rules (author, branch, trace id, ...).
pub type RuleContext = HashMap<String, String>;

/// A single pluggable rule.
pub trait ValidationRule: Send + Sync + std::fmt::Debug {
    fn rule_id(&self) -> &str;
    fn applies_to(&self, level: ValidationLevel) -> bool;
    fn validate(&self, data: &Value, ctx: &RuleContext) -> Vec<ValidationError>;
}

/// Maps rules to the levels they run at.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Arc<dyn ValidationRule>) {
        self.rules.push(rule);
    }

    pub fn rules_for_level(&self, level: ValidationLevel) -> Vec<Arc<dyn ValidationRule>> {
        self.rules.iter().filter(|r| r.applies_to(level)).cloned().collect()
    }
}

/// The external rule engine seam consumed by the rule validator.
#[async_trait]
pub trait RuleEngine: Send + Sync + std::fmt::Debug {
    async fn evaluate(
        &self,
        data: &Value,
        level: ValidationLevel,
        ctx: &RuleContext,
    ) -> Result<ValidationResult, RuleEngineError>;
}

/// Required-fields check by `@type`.
#[derive(Debug)]
pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn rule_id(&self) -> &str {
        "required_fields"
    }

    fn applies_to(&self, _level: ValidationLevel) -> bool {
        true
    }

    fn validate(&self, data: &Value, _ctx: &RuleContext) -> Vec<ValidationError> {
        let Some(obj) = data.as_object() else { return Vec::new() };
        let Some(doc_type) = obj.get("@type").and_then(Value::as_str) else {
            return Vec::new();
        };
        let required: &[&str] = match doc_type {
            "ObjectType" => &["name", "@id"],
            "Branch" => &["name", "source_branch"],
            "Property" => &["name", "type", "object_type"],
            "ValidationRule" => &["name", "rule_type"],
            _ => return Vec::new(),
        };
        let missing: Vec<&str> =
            required.iter().filter(|f| !obj.contains_key(**f)).copied().collect();
        if missing.is_empty() {
            return Vec::new();
        }
        vec![ValidationError::new(
            "required_fields",
            "MISSING_REQUIRED_FIELDS",
            format!("missing required fields for {doc_type}: {missing:?}"),
            ValidationCategory::Semantic,
            Severity::High,
        )]
    }
}

/// Shape checks for common scalar fields.
#[derive(Debug)]
pub struct FieldShapeRule {
    email: regex::Regex,
}

impl Default for FieldShapeRule {
    fn default() -> Self {
        Self {
            email: regex::Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
                .expect("email regex"),
        }
    }
}

impl ValidationRule for FieldShapeRule {
    fn rule_id(&self) -> &str {
        "field_shape"
    }

    fn applies_to(&self, level: ValidationLevel) -> bool {
        level != ValidationLevel::Minimal
    }

    fn validate(&self, data: &Value, _ctx: &RuleContext) -> Vec<ValidationError> {
        let Some(obj) = data.as_object() else { return Vec::new() };
        let mut errors = Vec::new();
        if let Some(name) = obj.get("name") {
            if !name.is_string() {
                errors.push(ValidationError::new(
                    "name",
                    "INVALID_TYPE",
                    "name must be a string",
                    ValidationCategory::Syntax,
                    Severity::High,
                ));
            }
        }
        if let Some(email) = obj.get("email").and_then(Value::as_str) {
            if !self.email.is_match(email) {
                errors.push(ValidationError::new(
                    "email",
                    "INVALID_FORMAT",
                    "invalid email format",
                    ValidationCategory::Syntax,
                    Severity::Medium,
                ));
            }
        }
        errors
    }
}

/// In-crate fallback engine: registry-driven, with the security-score
/// deductions the full service applies.
#[derive(Debug)]
pub struct BasicRuleEngine {
    registry: RuleRegistry,
}

impl Default for BasicRuleEngine {
    fn default() -> Self {
        let mut registry = RuleRegistry::new();
        registry.register(Arc::new(RequiredFieldsRule));
        registry.register(Arc::new(FieldShapeRule::default()));
        Self { registry }
    }
}

impl BasicRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: RuleRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RuleEngine for BasicRuleEngine {
    async fn evaluate(
        &self,
        data: &Value,
        level: ValidationLevel,
        ctx: &RuleContext,
    ) -> Result<ValidationResult, RuleEngineError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut security_score: i32 = 100;

        for rule in self.registry.rules_for_level(level) {
            for finding in rule.validate(data, ctx) {
                let deduction = match (finding.category, finding.severity.blocks_commit()) {
                    (ValidationCategory::Security, true) => 20,
                    (ValidationCategory::Security, false) => 5,
                    _ => 0,
                };
                security_score -= deduction;
                if finding.severity.blocks_commit() {
                    errors.push(finding);
                } else {
                    warnings.push(finding);
                }
            }
        }

        Ok(ValidationResult::assemble(
            level,
            errors,
            warnings,
            security_score.clamp(0, 100) as u8,
        ))
    }
}

/// TTL + size bounded cache of validation results, keyed by a hash of
/// `(data, level, scope)`.
#[derive(Debug)]
pub struct ValidationCache {
    entries: Mutex<HashMap<u64, (ValidationResult, chrono::DateTime<chrono::Utc>)>>,
    ttl: Duration,
    max_size: usize,
    clock: Arc<dyn WallClock>,
}

impl ValidationCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self::with_clock(ttl, max_size, Arc::new(SystemWallClock))
    }

    pub fn with_clock(ttl: Duration, max_size: usize, clock: Arc<dyn WallClock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, max_size, clock }
    }

    pub fn key(data: &Value, level: ValidationLevel, scope: ValidationScope) -> u64 {
        let mut hasher = DefaultHasher::new();
        data.to_string().hash(&mut hasher);
        format!("{level:?}/{scope:?}").hash(&mut hasher);
        hasher.finish()
    }

    pub fn get(&self, key: u64) -> Option<ValidationResult> {
        let now = self.clock.now_utc();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(&key) {
            Some((result, expires_at)) if *expires_at > now => {
                let mut hit = result.clone();
                hit.cache_used = true;
                Some(hit)
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: u64, result: ValidationResult) {
        let now = self.clock.now_utc();
        let expires_at = now + chrono::Duration::milliseconds(self.ttl.as_millis() as i64);
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() >= self.max_size {
            entries.retain(|_, (_, at)| *at > now);
            if entries.len() >= self.max_size {
                let oldest = entries.iter().min_by_key(|entry| entry.1 .1).map(|entry| *entry.0);
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, (result, expires_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualWallClock;
    use serde_json::json;

    #[test]
    fn result_invariant_holds() {
        let ok = ValidationResult::assemble(ValidationLevel::Standard, vec![], vec![], 100);
        assert!(ok.is_valid);

        let err = ValidationError::new(
            "f",
            "X",
            "bad",
            ValidationCategory::Semantic,
            Severity::High,
        );
        let failed =
            ValidationResult::assemble(ValidationLevel::Standard, vec![err], vec![], 100);
        assert!(!failed.is_valid);

        let low_score = ValidationResult::assemble(ValidationLevel::Standard, vec![], vec![], 50);
        assert!(!low_score.is_valid, "score below threshold invalidates");
    }

    #[tokio::test]
    async fn basic_engine_flags_missing_fields() {
        let engine = BasicRuleEngine::new();
        let result = engine
            .evaluate(
                &json!({"@type": "ObjectType", "name": "Invoice"}),
                ValidationLevel::Standard,
                &RuleContext::new(),
            )
            .await
            .unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].code, "MISSING_REQUIRED_FIELDS");
    }

    #[tokio::test]
    async fn basic_engine_passes_complete_documents() {
        let engine = BasicRuleEngine::new();
        let result = engine
            .evaluate(
                &json!({"@type": "ObjectType", "name": "Invoice", "@id": "Invoice"}),
                ValidationLevel::Standard,
                &RuleContext::new(),
            )
            .await
            .unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn bad_email_is_a_warning_not_an_error() {
        let engine = BasicRuleEngine::new();
        let result = engine
            .evaluate(
                &json!({"email": "not-an-email"}),
                ValidationLevel::Standard,
                &RuleContext::new(),
            )
            .await
            .unwrap();
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn minimal_level_skips_shape_rule() {
        let engine = BasicRuleEngine::new();
        let result = engine
            .evaluate(
                &json!({"email": "not-an-email"}),
                ValidationLevel::Minimal,
                &RuleContext::new(),
            )
            .await
            .unwrap();
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn cache_hits_within_ttl_and_expires_after() {
        let clock = Arc::new(ManualWallClock::new());
        let cache = ValidationCache::with_clock(Duration::from_secs(300), 10, clock.clone());
        let data = json!({"@type": "ObjectType"});
        let key = ValidationCache::key(&data, ValidationLevel::Standard, ValidationScope::Schema);

        assert!(cache.get(key).is_none());
        cache.put(key, ValidationResult::valid(ValidationLevel::Standard));

        let hit = cache.get(key).unwrap();
        assert!(hit.cache_used);

        clock.advance(Duration::from_secs(301));
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn cache_keys_differ_by_level_and_scope() {
        let data = json!({"a": 1});
        let k1 = ValidationCache::key(&data, ValidationLevel::Standard, ValidationScope::Schema);
        let k2 = ValidationCache::key(&data, ValidationLevel::Strict, ValidationScope::Schema);
        let k3 = ValidationCache::key(&data, ValidationLevel::Standard, ValidationScope::Data);
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn cache_evicts_at_capacity() {
        let cache = ValidationCache::new(Duration::from_secs(300), 2);
        for i in 0..3u64 {
            cache.put(i, ValidationResult::valid(ValidationLevel::Standard));
        }
        let live = (0..3u64).filter(|k| cache.get(*k).is_some()).count();
        assert!(live <= 2);
    }
}
