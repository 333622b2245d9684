//! Promotion engine.
//!
//! Moves records up the tiers. LTM writes are at-most-once: validation runs
//! without any lock held, then a per-id critical section re-reads the record
//! and performs a conditional insert keyed by the record id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::decision::{PromotionSignals, decide, evaluate_transition};
use crate::config::{CacheConfig, PolicyConfig, PromotionConfig};
use crate::memory::{LongTermStore, MemoryRecord, MemoryTier, TieredCache};
use crate::policy::{ConstitutionalValidator, ValidationContext};
use crate::utils::now_utc;
use crate::{MemoryError, MemoryResult};

/// Result of one promotion attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PromotionOutcome {
    /// The record moved; `record.tier` is its new tier
    Promoted { record: MemoryRecord, from: MemoryTier },
    /// Another caller already wrote this record to LTM
    AlreadyPromoted { record: MemoryRecord },
    /// Validation was unavailable; retry later
    Deferred { id: String, reason: String },
    /// Validation rejected the content
    Blocked { id: String, violations: Vec<String> },
    /// Thresholds not met
    NotEligible { id: String, failed: Vec<String> },
}

impl PromotionOutcome {
    /// Record now held in LTM, if the outcome produced one
    pub fn ltm_record(&self) -> Option<&MemoryRecord> {
        match self {
            Self::Promoted { record, .. } if record.tier == MemoryTier::Ltm => Some(record),
            Self::AlreadyPromoted { record } => Some(record),
            _ => None,
        }
    }
}

/// Drives STM -> ITM -> LTM transitions
pub struct PromotionEngine {
    cache: Arc<TieredCache>,
    ltm: LongTermStore,
    validator: Arc<dyn ConstitutionalValidator>,
    thresholds: PromotionConfig,
    stm_ttl: Duration,
    validation_timeout: StdDuration,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PromotionEngine {
    pub fn new(
        cache: Arc<TieredCache>,
        ltm: LongTermStore,
        validator: Arc<dyn ConstitutionalValidator>,
        thresholds: PromotionConfig,
        cache_config: &CacheConfig,
        policy_config: &PolicyConfig,
    ) -> Self {
        Self {
            cache,
            ltm,
            validator,
            thresholds,
            stm_ttl: Duration::seconds(cache_config.stm_ttl_secs as i64),
            validation_timeout: StdDuration::from_millis(policy_config.timeout_ms),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Apply whatever transition the decision function picks for `id`
    pub async fn evaluate(&self, owner_id: &str, id: &str) -> MemoryResult<PromotionOutcome> {
        let record = match self.cache.get_for_promotion(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let record = self.ltm.get(owner_id, id, false).await?;
                return Ok(PromotionOutcome::AlreadyPromoted { record });
            }
            Err(e) => return Err(e),
        };
        if record.owner_id != owner_id {
            return Err(MemoryError::forbidden(owner_id, id));
        }

        let signals = PromotionSignals::from_record(&record, now_utc());
        match decide(record.tier, &signals, &self.thresholds, self.stm_ttl) {
            Some(MemoryTier::Itm) => self.move_to_itm(&record).await,
            Some(MemoryTier::Ltm) => self.promote_to_ltm(record).await,
            Some(MemoryTier::Stm) | None => {
                let next = match record.tier {
                    MemoryTier::Stm => MemoryTier::Itm,
                    _ => MemoryTier::Ltm,
                };
                let failed = evaluate_transition(record.tier, next, &signals, &self.thresholds, self.stm_ttl);
                tracing::debug!(id, tier = %record.tier, ?failed, "record not eligible for promotion");
                Ok(PromotionOutcome::NotEligible {
                    id: id.to_string(),
                    failed,
                })
            }
        }
    }

    /// Give every STM record past its TTL a decision before the sweep drops it
    pub async fn promote_aged(&self) -> Vec<(String, MemoryResult<PromotionOutcome>)> {
        let mut outcomes = Vec::new();
        for record in self.cache.aged_stm().await {
            let outcome = self.evaluate(&record.owner_id, &record.id).await;
            outcomes.push((record.id, outcome));
        }
        outcomes
    }

    /// Promote on request; thresholds still apply and failures are rule violations
    pub async fn promote(&self, owner_id: &str, id: &str, target: MemoryTier) -> MemoryResult<PromotionOutcome> {
        let record = match self.cache.get_for_promotion(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let existing = self.ltm.get(owner_id, id, false).await?;
                return if target == MemoryTier::Ltm {
                    Ok(PromotionOutcome::AlreadyPromoted { record: existing })
                } else {
                    Err(MemoryError::rule_violation(format!(
                        "cannot move a record from ltm to {}",
                        target
                    )))
                };
            }
            Err(e) => return Err(e),
        };

        if record.owner_id != owner_id {
            return Err(MemoryError::forbidden(owner_id, id));
        }
        if record.tier == target {
            return Ok(PromotionOutcome::NotEligible {
                id: id.to_string(),
                failed: vec![format!("already in {}", target)],
            });
        }

        let signals = PromotionSignals::from_record(&record, now_utc());
        let failed = evaluate_transition(record.tier, target, &signals, &self.thresholds, self.stm_ttl);
        if !failed.is_empty() {
            return Err(MemoryError::rule_violation(failed.join("; ")));
        }

        match target {
            MemoryTier::Itm => self.move_to_itm(&record).await,
            MemoryTier::Ltm => self.promote_to_ltm(record).await,
            MemoryTier::Stm => Err(MemoryError::rule_violation("cannot promote into stm")),
        }
    }

    async fn move_to_itm(&self, record: &MemoryRecord) -> MemoryResult<PromotionOutcome> {
        let (moved, evicted) = self.cache.move_to_itm(&record.id).await?;
        tracing::debug!(id = %moved.id, access_count = moved.access_count, evicted = evicted.len(), "promoted stm -> itm");
        Ok(PromotionOutcome::Promoted {
            record: moved,
            from: MemoryTier::Stm,
        })
    }

    async fn promote_to_ltm(&self, snapshot: MemoryRecord) -> MemoryResult<PromotionOutcome> {
        let id = snapshot.id.clone();
        let context = ValidationContext::for_actor(&snapshot.owner_id).with_memory(&id);

        // Validation awaits external computation: no lock held here
        let validation = tokio::time::timeout(
            self.validation_timeout,
            self.validator.validate_content(&snapshot.text, &context),
        )
        .await;
        let result = match validation {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(id = %id, "promotion deferred: {}", e);
                return Ok(PromotionOutcome::Deferred { id, reason: e.to_string() });
            }
            Err(_) => {
                tracing::warn!(id = %id, timeout_ms = self.validation_timeout.as_millis() as u64, "promotion deferred: validation timed out");
                return Ok(PromotionOutcome::Deferred {
                    id,
                    reason: "validation timed out".to_string(),
                });
            }
        };

        if !result.valid {
            self.mark_invalid(&id).await;
            tracing::info!(id = %id, violations = ?result.violations, "promotion blocked by validation");
            return Ok(PromotionOutcome::Blocked {
                id,
                violations: result.violations,
            });
        }

        let lock = self.lock_for(&id);
        let outcome = {
            let _guard = lock.lock().await;
            self.write_ltm(&snapshot.owner_id, &id).await
        };
        self.release_lock(&id, lock);
        outcome
    }

    /// Critical section: re-read, conditional insert, drop from cache
    async fn write_ltm(&self, owner_id: &str, id: &str) -> MemoryResult<PromotionOutcome> {
        let current = match self.cache.get_for_promotion(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let record = self.ltm.get(owner_id, id, false).await?;
                return Ok(PromotionOutcome::AlreadyPromoted { record });
            }
            Err(e) => return Err(e),
        };

        // Flagged by another validation while ours ran
        if !current.constitutional_valid {
            tracing::info!(id, "promotion blocked: record flagged invalid during validation");
            return Ok(PromotionOutcome::Blocked {
                id: id.to_string(),
                violations: vec!["flagged invalid".to_string()],
            });
        }

        let from = current.tier;
        let mut promoted = current;
        promoted.tier = MemoryTier::Ltm;
        promoted.expires_at = None;
        promoted.constitutional_valid = true;

        if !self.ltm.insert(&promoted).await? {
            let existing = self
                .ltm
                .find(id)
                .await?
                .ok_or_else(|| MemoryError::ConcurrentPromotionConflict { id: id.to_string() })?;
            if existing.owner_id != promoted.owner_id {
                return Err(MemoryError::ConcurrentPromotionConflict { id: id.to_string() });
            }
            self.cache.remove(id).await?;
            return Ok(PromotionOutcome::AlreadyPromoted { record: existing });
        }

        self.cache.remove(id).await?;
        tracing::info!(id, from = %from, access_count = promoted.access_count, "promoted to ltm");
        Ok(PromotionOutcome::Promoted { record: promoted, from })
    }

    /// Flag a cached record so the decision function stops picking LTM
    pub(crate) async fn mark_invalid(&self, id: &str) {
        let Ok(mut record) = self.cache.get_for_promotion(id).await else {
            return;
        };
        if !record.constitutional_valid {
            return;
        }
        record.constitutional_valid = false;
        if let Err(e) = self.cache.update(record).await {
            tracing::debug!(id, "could not flag record invalid: {}", e);
        }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn release_lock(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Map entry plus ours: nobody else is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::migrations;
    use crate::memory::{MemoryKind, Outcome};
    use crate::policy::{AlignmentResult, ValidationResult};
    use crate::utils::RetryPolicy;
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Validator returning a fixed verdict
    struct FixedValidator {
        valid: bool,
        score: f32,
        calls: AtomicUsize,
    }

    impl FixedValidator {
        fn new(valid: bool, score: f32) -> Arc<Self> {
            Arc::new(Self {
                valid,
                score,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConstitutionalValidator for FixedValidator {
        async fn validate_content(&self, _text: &str, _context: &ValidationContext) -> MemoryResult<ValidationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ValidationResult {
                valid: self.valid,
                score: self.score,
                matched_patterns: Default::default(),
                principle_scores: Default::default(),
                violations: if self.valid { vec![] } else { vec!["violence".into()] },
                warnings: vec![],
                blocking: vec![],
                policy_version: 1,
                audit_entry_id: None,
            })
        }

        async fn validate_alignment(
            &self,
            _text: &str,
            _self_assessment: &str,
            _context: &ValidationContext,
        ) -> MemoryResult<AlignmentResult> {
            Err(MemoryError::validation_unavailable("not used"))
        }
    }

    struct DownValidator;

    #[async_trait]
    impl ConstitutionalValidator for DownValidator {
        async fn validate_content(&self, _text: &str, _context: &ValidationContext) -> MemoryResult<ValidationResult> {
            Err(MemoryError::validation_unavailable("policy service offline"))
        }

        async fn validate_alignment(
            &self,
            _text: &str,
            _self_assessment: &str,
            _context: &ValidationContext,
        ) -> MemoryResult<AlignmentResult> {
            Err(MemoryError::validation_unavailable("policy service offline"))
        }
    }

    /// Flags the record invalid while its own validation is still running
    struct FlaggingValidator {
        cache: Arc<TieredCache>,
    }

    #[async_trait]
    impl ConstitutionalValidator for FlaggingValidator {
        async fn validate_content(&self, _text: &str, context: &ValidationContext) -> MemoryResult<ValidationResult> {
            if let Some(id) = &context.memory_id {
                let mut record = self.cache.get(id).await?;
                record.constitutional_valid = false;
                self.cache.update(record).await?;
            }
            Ok(ValidationResult {
                valid: true,
                score: 0.9,
                matched_patterns: Default::default(),
                principle_scores: Default::default(),
                violations: vec![],
                warnings: vec![],
                blocking: vec![],
                policy_version: 1,
                audit_entry_id: None,
            })
        }

        async fn validate_alignment(
            &self,
            _text: &str,
            _self_assessment: &str,
            _context: &ValidationContext,
        ) -> MemoryResult<AlignmentResult> {
            Err(MemoryError::validation_unavailable("not used"))
        }
    }

    async fn tiers() -> (Arc<TieredCache>, LongTermStore) {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        let db = Arc::new(Mutex::new(conn));
        let cache = TieredCache::open(CacheConfig::default(), db.clone(), RetryPolicy::default())
            .await
            .unwrap();
        (Arc::new(cache), LongTermStore::new(db, RetryPolicy::default()))
    }

    fn build(cache: &Arc<TieredCache>, ltm: &LongTermStore, validator: Arc<dyn ConstitutionalValidator>) -> Arc<PromotionEngine> {
        Arc::new(PromotionEngine::new(
            cache.clone(),
            ltm.clone(),
            validator,
            PromotionConfig::default(),
            &CacheConfig::default(),
            &PolicyConfig::default(),
        ))
    }

    async fn engine(validator: Arc<dyn ConstitutionalValidator>) -> (Arc<PromotionEngine>, Arc<TieredCache>, LongTermStore) {
        let (cache, ltm) = tiers().await;
        (build(&cache, &ltm, validator), cache, ltm)
    }

    fn record(id: &str, tier: MemoryTier) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            owner_id: "owner".into(),
            session_id: None,
            tier,
            kind: MemoryKind::Lesson,
            text: "I will never give up".into(),
            embedding: None,
            tags: Default::default(),
            emotional_weight: 0.6,
            confidence_score: 0.8,
            access_count: 0,
            constitutional_valid: true,
            outcome: Outcome::Neutral,
            outcome_count: 0,
            success_count: 0,
            size_bytes: 100,
            created_at: now_utc(),
            expires_at: None,
            deleted_at: None,
        }
    }

    async fn accessed_itm(cache: &TieredCache, id: &str, times: u32) {
        cache.put(record(id, MemoryTier::Itm)).await.unwrap();
        for _ in 0..times {
            cache.touch(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_itm_record_promotes_to_ltm() {
        let (engine, cache, ltm) = engine(FixedValidator::new(true, 0.85)).await;
        accessed_itm(&cache, "m1", 3).await;

        let outcome = engine.evaluate("owner", "m1").await.unwrap();
        let record = outcome.ltm_record().unwrap();
        assert_eq!(record.tier, MemoryTier::Ltm);
        assert!(record.access_count >= 3);
        assert!(record.expires_at.is_none());

        assert!(cache.get("m1").await.unwrap_err().is_not_found());
        assert_eq!(ltm.get("owner", "m1", false).await.unwrap().id, "m1");
    }

    #[tokio::test]
    async fn test_concurrent_promotion_writes_once() {
        let validator = FixedValidator::new(true, 0.9);
        let (engine, cache, ltm) = engine(validator.clone()).await;
        accessed_itm(&cache, "m1", 3).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move { engine.promote("owner", "m1", MemoryTier::Ltm).await }));
        }

        let mut promoted = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            match &outcome {
                PromotionOutcome::Promoted { .. } => promoted += 1,
                PromotionOutcome::AlreadyPromoted { .. } => {}
                other => panic!("unexpected outcome {:?}", other),
            }
            assert_eq!(outcome.ltm_record().unwrap().id, "m1");
        }

        assert_eq!(promoted, 1);
        assert_eq!(ltm.list("owner", None, false).await.unwrap().len(), 1);
        assert!(engine.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_content_blocks_promotion() {
        let (engine, cache, ltm) = engine(FixedValidator::new(false, 0.4)).await;
        accessed_itm(&cache, "m1", 3).await;

        let outcome = engine.evaluate("owner", "m1").await.unwrap();
        assert!(matches!(outcome, PromotionOutcome::Blocked { .. }));
        assert!(!cache.get("m1").await.unwrap().constitutional_valid);
        assert!(ltm.find("m1").await.unwrap().is_none());

        // The flag now keeps the decision function away from LTM
        let again = engine.evaluate("owner", "m1").await.unwrap();
        assert!(matches!(again, PromotionOutcome::NotEligible { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_validator_defers() {
        let (engine, cache, ltm) = engine(Arc::new(DownValidator)).await;
        accessed_itm(&cache, "m1", 3).await;

        let outcome = engine.evaluate("owner", "m1").await.unwrap();
        assert!(matches!(outcome, PromotionOutcome::Deferred { .. }));
        // Never defaulted to valid
        assert!(ltm.find("m1").await.unwrap().is_none());
        assert!(cache.get("m1").await.unwrap().constitutional_valid);
    }

    #[tokio::test]
    async fn test_stm_moves_to_itm_after_two_accesses() {
        let (engine, cache, _) = engine(FixedValidator::new(true, 1.0)).await;
        cache.put(record("m1", MemoryTier::Stm)).await.unwrap();
        cache.touch("m1").await.unwrap();
        cache.touch("m1").await.unwrap();

        match engine.evaluate("owner", "m1").await.unwrap() {
            PromotionOutcome::Promoted { record, from } => {
                assert_eq!(from, MemoryTier::Stm);
                assert_eq!(record.tier, MemoryTier::Itm);
                assert_eq!(record.access_count, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_explicit_promote_enforces_thresholds() {
        let (engine, cache, _) = engine(FixedValidator::new(true, 1.0)).await;
        accessed_itm(&cache, "m1", 1).await;

        let err = engine.promote("owner", "m1", MemoryTier::Ltm).await.unwrap_err();
        assert!(matches!(err, MemoryError::RuleViolation { .. }));
        assert!(engine.promote("intruder", "m1", MemoryTier::Ltm).await.unwrap_err().is_forbidden());
    }

    #[tokio::test]
    async fn test_evaluate_rejects_other_owners() {
        let (engine, cache, ltm) = engine(FixedValidator::new(true, 1.0)).await;
        ltm.insert(&record("kept", MemoryTier::Ltm)).await.unwrap();
        cache.put(record("cached", MemoryTier::Stm)).await.unwrap();

        assert!(engine.evaluate("intruder", "kept").await.unwrap_err().is_forbidden());
        assert!(engine.evaluate("intruder", "cached").await.unwrap_err().is_forbidden());
        assert!(matches!(
            engine.evaluate("owner", "kept").await.unwrap(),
            PromotionOutcome::AlreadyPromoted { .. }
        ));
        assert!(engine.evaluate("owner", "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stm_past_one_cycle_moves_to_itm() {
        let (engine, cache, _) = engine(FixedValidator::new(true, 1.0)).await;
        let mut aged = record("m1", MemoryTier::Stm);
        aged.confidence_score = 0.5;
        aged.created_at = now_utc() - Duration::seconds(CacheConfig::default().stm_ttl_secs as i64 + 5);
        cache.put(aged).await.unwrap();
        assert!(cache.get("m1").await.unwrap_err().is_not_found());

        match engine.evaluate("owner", "m1").await.unwrap() {
            PromotionOutcome::Promoted { record, from } => {
                assert_eq!(from, MemoryTier::Stm);
                assert_eq!(record.tier, MemoryTier::Itm);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(cache.get("m1").await.unwrap().tier, MemoryTier::Itm);
    }

    #[tokio::test]
    async fn test_aged_records_promoted_before_sweep() {
        let (engine, cache, _) = engine(FixedValidator::new(true, 1.0)).await;
        let mut aged = record("old", MemoryTier::Stm);
        aged.confidence_score = 0.5;
        aged.created_at = now_utc() - Duration::hours(2);
        cache.put(aged).await.unwrap();
        cache.put(record("fresh", MemoryTier::Stm)).await.unwrap();

        let outcomes = engine.promote_aged().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "old");
        assert!(matches!(outcomes[0].1, Ok(PromotionOutcome::Promoted { .. })));

        assert_eq!(cache.expire_sweep().await.unwrap(), 0);
        assert_eq!(cache.count("owner", MemoryTier::Itm).await, 1);
        assert_eq!(cache.count("owner", MemoryTier::Stm).await, 1);
    }

    #[tokio::test]
    async fn test_flag_raised_during_validation_blocks_write() {
        let (cache, ltm) = tiers().await;
        let engine = build(&cache, &ltm, Arc::new(FlaggingValidator { cache: cache.clone() }));
        accessed_itm(&cache, "m1", 3).await;

        let outcome = engine.evaluate("owner", "m1").await.unwrap();
        assert!(matches!(outcome, PromotionOutcome::Blocked { .. }));
        assert!(ltm.find("m1").await.unwrap().is_none());
        assert!(!cache.get("m1").await.unwrap().constitutional_valid);
        assert!(engine.locks.lock().unwrap().is_empty());
    }
}
