//! Constitutional validator.
//!
//! Scores text against the rule set and the active policy's principles, and
//! appends an audit entry for every call before returning.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::audit::AuditLog;
use super::record::PolicyRecord;
use super::rules::{RuleEvaluation, RuleSet};
use crate::config::PolicyConfig;
use crate::utils::content_hash;
use crate::MemoryResult;

/// Who is asking and about which memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationContext {
    pub actor_id: Option<String>,
    pub memory_id: Option<String>,
}

impl ValidationContext {
    pub fn for_actor(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            memory_id: None,
        }
    }

    pub fn with_memory(mut self, memory_id: impl Into<String>) -> Self {
        self.memory_id = Some(memory_id.into());
        self
    }
}

/// Outcome of validating one text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    /// Minimum over all principle scores
    pub score: f32,
    pub matched_patterns: BTreeSet<String>,
    pub principle_scores: BTreeMap<String, f32>,
    /// Categories matched at or above their threshold
    pub violations: Vec<String>,
    /// Categories matched below their threshold
    pub warnings: Vec<String>,
    /// Violated categories that reject writes in strict mode
    pub blocking: Vec<String>,
    pub policy_version: u32,
    pub audit_entry_id: Option<String>,
}

/// Outcome of checking a self-assessment against the content it describes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub aligned: bool,
    pub score: f32,
    pub principle_scores: BTreeMap<String, f32>,
    /// Stated verdict in the assessment agrees with the content's validity
    pub consistent: bool,
    pub concerns: Vec<String>,
    pub audit_entry_id: Option<String>,
}

/// What the promotion engine and reflection task need from a validator
#[async_trait]
pub trait ConstitutionalValidator: Send + Sync {
    async fn validate_content(&self, text: &str, context: &ValidationContext) -> MemoryResult<ValidationResult>;

    async fn validate_alignment(
        &self,
        text: &str,
        self_assessment: &str,
        context: &ValidationContext,
    ) -> MemoryResult<AlignmentResult>;
}

/// Rule-based validator backed by the audit log
pub struct PolicyValidator {
    rules: Arc<RuleSet>,
    policy: PolicyRecord,
    audit: AuditLog,
    lineage: String,
    alignment_threshold: f32,
}

impl PolicyValidator {
    pub fn new(rules: Arc<RuleSet>, policy: PolicyRecord, audit: AuditLog, config: &PolicyConfig) -> Self {
        Self {
            rules,
            policy,
            audit,
            lineage: config.lineage.clone(),
            alignment_threshold: config.alignment_threshold,
        }
    }

    pub fn policy(&self) -> &PolicyRecord {
        &self.policy
    }

    /// Score text without touching the audit log
    pub fn evaluate(&self, text: &str) -> ValidationResult {
        let evaluation = self.rules.evaluate(text);
        let principle_scores = self.principle_scores(&evaluation);
        let score = principle_scores.values().copied().fold(1.0f32, f32::min);

        let violations: Vec<String> = evaluation.violations().map(|m| m.category.clone()).collect();
        ValidationResult {
            valid: violations.is_empty(),
            score,
            matched_patterns: evaluation
                .matches
                .iter()
                .flat_map(|m| m.patterns.iter().cloned())
                .collect(),
            principle_scores,
            blocking: evaluation
                .violations()
                .filter(|m| m.blocking)
                .map(|m| m.category.clone())
                .collect(),
            warnings: evaluation.warnings().map(|m| m.category.clone()).collect(),
            violations,
            policy_version: self.policy.version,
            audit_entry_id: None,
        }
    }

    fn principle_scores(&self, evaluation: &RuleEvaluation) -> BTreeMap<String, f32> {
        self.policy
            .principles
            .iter()
            .map(|principle| {
                let penalty = evaluation.penalties.get(&principle.name).copied().unwrap_or(0.0);
                let score = (1.0 - principle.weight * penalty).clamp(0.0, 1.0);
                (principle.name.clone(), score)
            })
            .collect()
    }
}

#[async_trait]
impl ConstitutionalValidator for PolicyValidator {
    async fn validate_content(&self, text: &str, context: &ValidationContext) -> MemoryResult<ValidationResult> {
        let mut result = self.evaluate(text);

        let entry = self
            .audit
            .append(&self.lineage, context.actor_id.as_deref(), "validate_content", &content_hash(text))
            .await?;
        result.audit_entry_id = Some(entry.id);

        if !result.valid {
            tracing::warn!(
                memory_id = context.memory_id.as_deref().unwrap_or("-"),
                violations = ?result.violations,
                score = result.score,
                "content failed constitutional validation"
            );
        }
        Ok(result)
    }

    async fn validate_alignment(
        &self,
        text: &str,
        self_assessment: &str,
        context: &ValidationContext,
    ) -> MemoryResult<AlignmentResult> {
        let content = self.evaluate(text);
        let assessment = self.evaluate(self_assessment);

        let principle_scores: BTreeMap<String, f32> = content
            .principle_scores
            .iter()
            .map(|(name, score)| {
                let other = assessment.principle_scores.get(name).copied().unwrap_or(1.0);
                (name.clone(), score.min(other))
            })
            .collect();
        let score = principle_scores.values().copied().fold(1.0f32, f32::min);

        let consistent = stated_alignment(self_assessment).is_none_or(|stated| stated == content.valid);

        let mut concerns = Vec::new();
        if score < self.alignment_threshold {
            concerns.push(format!("alignment score {:.2} below {:.2}", score, self.alignment_threshold));
        }
        concerns.extend(content.violations.iter().map(|c| format!("content: {}", c)));
        concerns.extend(assessment.violations.iter().map(|c| format!("self-assessment: {}", c)));
        if !consistent {
            concerns.push("self-assessment verdict contradicts content validation".to_string());
        }

        let aligned = score >= self.alignment_threshold && consistent && content.valid && assessment.valid;

        let hash = content_hash(&format!("{}\n---\n{}", text, self_assessment));
        let entry = self
            .audit
            .append(&self.lineage, context.actor_id.as_deref(), "validate_alignment", &hash)
            .await?;

        Ok(AlignmentResult {
            aligned,
            score,
            principle_scores,
            consistent,
            concerns,
            audit_entry_id: Some(entry.id),
        })
    }
}

/// Verdict the assessment states about itself, if it states one
fn stated_alignment(assessment: &str) -> Option<bool> {
    let lower = assessment.to_lowercase();

    let answer = lower
        .lines()
        .find_map(|line| line.trim().strip_prefix("a2:").map(str::trim));
    match answer.and_then(|a| a.split(|c: char| !c.is_alphanumeric()).next()) {
        Some("no") => return Some(false),
        Some("yes") => return Some(true),
        _ => {}
    }

    if lower.contains("not aligned") || lower.contains("misaligned") {
        Some(false)
    } else if lower.contains("aligned") {
        Some(true)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::migrations;
    use crate::policy::record::{Principle, default_principles};
    use crate::utils::{RetryPolicy, now_utc};
    use rusqlite::Connection;
    use tokio::sync::Mutex;

    fn policy(principles: Vec<Principle>) -> PolicyRecord {
        PolicyRecord {
            id: "p1".into(),
            version: 1,
            principles,
            signature: String::new(),
            created_at: now_utc(),
        }
    }

    fn validator_with(principles: Vec<Principle>) -> (PolicyValidator, AuditLog) {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        let audit = AuditLog::new(Arc::new(Mutex::new(conn)), "k", RetryPolicy::default());
        let validator = PolicyValidator::new(
            Arc::new(RuleSet::standard().unwrap()),
            policy(principles),
            audit.clone(),
            &PolicyConfig::default(),
        );
        (validator, audit)
    }

    fn validator() -> (PolicyValidator, AuditLog) {
        validator_with(default_principles())
    }

    #[tokio::test]
    async fn test_clean_content_is_valid() {
        let (validator, _) = validator();
        let result = validator
            .validate_content("I will never give up", &ValidationContext::default())
            .await
            .unwrap();

        assert!(result.valid);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.principle_scores.len(), 8);
        assert!(result.matched_patterns.is_empty());
    }

    #[tokio::test]
    async fn test_harmful_content_is_invalid_and_audited() {
        let (validator, audit) = validator();
        let result = validator
            .validate_content("we should attack people tonight", &ValidationContext::for_actor("u1"))
            .await
            .unwrap();

        assert!(!result.valid);
        assert_eq!(result.violations, vec!["violence"]);
        assert_eq!(result.blocking, vec!["violence"]);
        assert!(result.score < 0.7);
        assert_eq!(result.principle_scores["truth"], 1.0);

        let entries = audit.list("constitution", None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor_id.as_deref(), Some("u1"));
        assert_eq!(entries[0].content_hash, content_hash("we should attack people tonight"));
        assert_eq!(result.audit_entry_id, Some(entries[0].id.clone()));
    }

    #[tokio::test]
    async fn test_warning_keeps_content_valid() {
        let (validator, _) = validator();
        let result = validator.evaluate("don't mislead customers");
        assert!(result.valid);
        assert_eq!(result.warnings, vec!["deception"]);
        assert!((result.score - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_principle_weight_scales_penalty() {
        let (validator, _) = validator_with(vec![Principle::new("truth", 2.0), Principle::new("fairness", 1.0)]);
        let result = validator.evaluate("don't mislead customers");
        assert!((result.principle_scores["truth"] - 0.6).abs() < 1e-6);
        assert_eq!(result.principle_scores["fairness"], 1.0);
        assert!((result.score - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_alignment_consistent_assessment() {
        let (validator, _) = validator();
        let assessment = "Q1: What was attempted?\nA1: encouragement\nQ2: Was it aligned?\nA2: Yes, no concerns\nQ3: How to improve?\nA3: keep going";
        let result = validator
            .validate_alignment("I will never give up", assessment, &ValidationContext::default())
            .await
            .unwrap();

        assert!(result.aligned);
        assert!(result.consistent);
        assert!(result.concerns.is_empty());
    }

    #[tokio::test]
    async fn test_alignment_detects_inconsistent_verdict() {
        let (validator, audit) = validator();
        let result = validator
            .validate_alignment(
                "I will never give up",
                "A2: No, this was misaligned",
                &ValidationContext::default(),
            )
            .await
            .unwrap();

        assert!(!result.consistent);
        assert!(!result.aligned);
        assert_eq!(audit.list("constitution", None).await.unwrap().len(), 1);
    }

    #[test]
    fn test_stated_alignment() {
        assert_eq!(stated_alignment("A2: Yes"), Some(true));
        assert_eq!(stated_alignment("q2: ...\n a2: no, it was not"), Some(false));
        assert_eq!(stated_alignment("The response was not aligned"), Some(false));
        assert_eq!(stated_alignment("fully aligned with policy"), Some(true));
        assert_eq!(stated_alignment("nothing to say"), None);
    }
}
