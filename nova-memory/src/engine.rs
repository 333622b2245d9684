//! Memory Engine Entry Point
//!
//! Ties the tiered cache, long-term store, validator, promotion engine and
//! distillation job together behind the operations collaborators call.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::distillation::{
    DistillationJob, DistillationReport, KnowledgeStore, ReflectionRecord, ReflectionStore, ReflectionTask,
};
use crate::memory::quota::{check_quota, estimate_size};
use crate::memory::{
    Embedder, EmbeddingGenerator, LongTermStore, MemoryPatch, MemoryRecord, MemoryStats, MemoryTier,
    PlanQuotaAuthority, QuotaAuthority, ScoredMemory, SearchQuery, StoreMemoryInput, TieredCache, rank_scored,
    score_candidate,
};
use crate::policy::{
    AuditLog, ConstitutionalValidator, PolicyRecord, PolicyRegistry, PolicyValidator, RuleSet, ValidationContext,
    ValidationResult,
};
use crate::promotion::{PromotionEngine, PromotionOutcome};
use crate::utils::{RetryPolicy, from_millis, now_utc, to_millis};
use crate::{MemoryError, MemoryResult};

const DEFAULT_EMOTIONAL_WEIGHT: f32 = 0.0;
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Tiered memory engine
///
/// # Example
///
/// ```rust,no_run
/// use nova_memory::{EngineConfig, MemoryEngine, MemoryKind, StoreMemoryInput};
///
/// async fn example() -> nova_memory::MemoryResult<()> {
///     let engine = MemoryEngine::open(EngineConfig::new("nova.db")).await?;
///
///     let record = engine
///         .store(StoreMemoryInput::new("alice", "I will never give up", MemoryKind::Lesson))
///         .await?;
///     let again = engine.retrieve("alice", &record.id).await?;
///     assert_eq!(again.text, record.text);
///
///     Ok(())
/// }
/// ```
pub struct MemoryEngine {
    config: EngineConfig,
    cache: Arc<TieredCache>,
    ltm: LongTermStore,
    embeddings: EmbeddingGenerator,
    quota: Arc<dyn QuotaAuthority>,
    policies: PolicyRegistry,
    audit: AuditLog,
    policy_validator: Arc<PolicyValidator>,
    validator: Arc<dyn ConstitutionalValidator>,
    promotion: Arc<PromotionEngine>,
    reflections: ReflectionStore,
    knowledge: KnowledgeStore,
    distillation: DistillationJob,
    validation_timeout: Duration,
    /// Serializes quota check + write per engine
    write_lock: Mutex<()>,
}

impl MemoryEngine {
    /// Open (or create) the database at `config.database_path`
    pub async fn open(config: EngineConfig) -> MemoryResult<Self> {
        config.validate()?;

        let conn = Connection::open(&config.database_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        tracing::info!(path = %config.database_path.display(), "memory engine opened");
        Self::from_connection(conn, config).await
    }

    /// Engine over a private in-memory database
    pub async fn open_in_memory(config: EngineConfig) -> MemoryResult<Self> {
        config.validate()?;
        Self::from_connection(Connection::open_in_memory()?, config).await
    }

    async fn from_connection(conn: Connection, config: EngineConfig) -> MemoryResult<Self> {
        crate::memory::migrations::run_migrations(&conn)?;
        crate::policy::migrations::run_migrations(&conn)?;
        crate::distillation::migrations::run_migrations(&conn)?;

        let db = Arc::new(Mutex::new(conn));
        let retry = RetryPolicy::new(&config.storage);

        let policies = PolicyRegistry::new(db.clone(), retry.clone());
        let policy = policies.ensure_default().await?;
        if !policy.verify_signature()? {
            return Err(MemoryError::policy(format!(
                "policy version {} failed signature verification",
                policy.version
            )));
        }

        let audit = AuditLog::new(db.clone(), config.policy.signing_key.clone(), retry.clone());
        let rules = Arc::new(RuleSet::standard()?);
        let policy_validator = Arc::new(PolicyValidator::new(rules, policy, audit.clone(), &config.policy));
        let validator: Arc<dyn ConstitutionalValidator> = policy_validator.clone();

        let cache = Arc::new(TieredCache::open(config.cache.clone(), db.clone(), retry.clone()).await?);
        let ltm = LongTermStore::new(db.clone(), retry.clone());
        let embeddings = EmbeddingGenerator::from_config(&config.embedding);
        let reflections = ReflectionStore::new(db.clone(), retry.clone());
        let knowledge = KnowledgeStore::new(db, retry);

        let (promotion, distillation) =
            wire(&config, &cache, &ltm, &validator, &embeddings, &reflections, &knowledge);

        Ok(Self {
            validation_timeout: Duration::from_millis(config.policy.timeout_ms),
            quota: Arc::new(PlanQuotaAuthority::new(config.quota.clone())),
            config,
            cache,
            ltm,
            embeddings,
            policies,
            audit,
            policy_validator,
            validator,
            promotion,
            reflections,
            knowledge,
            distillation,
            write_lock: Mutex::new(()),
        })
    }

    /// Replace the embedding backend
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embeddings = EmbeddingGenerator::new(embedder, Duration::from_millis(self.config.embedding.timeout_ms));
        self.rewire();
        self
    }

    /// Replace the quota authority
    pub fn with_quota_authority(mut self, quota: Arc<dyn QuotaAuthority>) -> Self {
        self.quota = quota;
        self
    }

    /// Replace the validator used for writes, promotion and reflection
    pub fn with_validator(mut self, validator: Arc<dyn ConstitutionalValidator>) -> Self {
        self.validator = validator;
        self.rewire();
        self
    }

    fn rewire(&mut self) {
        let (promotion, distillation) = wire(
            &self.config,
            &self.cache,
            &self.ltm,
            &self.validator,
            &self.embeddings,
            &self.reflections,
            &self.knowledge,
        );
        self.promotion = promotion;
        self.distillation = distillation;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Policy version the built-in validator enforces
    pub fn active_policy(&self) -> &PolicyRecord {
        self.policy_validator.policy()
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Memory operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a new memory. Embedding or validation outages degrade the record
    /// instead of failing the write.
    pub async fn store(&self, input: StoreMemoryInput) -> MemoryResult<MemoryRecord> {
        validate_input(&input)?;

        let tags: BTreeSet<String> = input
            .tags
            .iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();

        let mut tier = input.tier_hint.unwrap_or(MemoryTier::Stm);
        let context = ValidationContext::for_actor(&input.owner_id);
        // Strict mode refuses blocking categories; anything milder is stored flagged
        let constitutional_valid = match self.validate_with_timeout(&input.text, &context).await {
            Ok(result) if !result.blocking.is_empty() && self.config.policy.strict_mode => {
                return Err(MemoryError::ConstitutionalViolation {
                    categories: result.blocking,
                });
            }
            Ok(result) => result.valid,
            Err(e) if e.is_degraded() => {
                tracing::warn!(owner = %input.owner_id, "storing unvalidated memory: {}", e);
                // LTM only admits validated content
                if tier == MemoryTier::Ltm {
                    tier = MemoryTier::Stm;
                }
                true
            }
            Err(e) => return Err(e),
        };
        if tier == MemoryTier::Ltm && !constitutional_valid {
            tracing::info!(owner = %input.owner_id, "invalid content stored in stm instead of ltm");
            tier = MemoryTier::Stm;
        }

        let embedding = self.embeddings.generate_or_none(&input.text).await;
        let dims = embedding.as_ref().map_or(0, Vec::len);

        let record = MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: input.owner_id,
            session_id: input.session_id,
            tier,
            kind: input.kind,
            size_bytes: estimate_size(&input.text, &tags, dims),
            text: input.text,
            embedding,
            tags,
            emotional_weight: input.emotional_weight.unwrap_or(DEFAULT_EMOTIONAL_WEIGHT),
            confidence_score: input.confidence_score.unwrap_or(DEFAULT_CONFIDENCE),
            access_count: 0,
            constitutional_valid,
            outcome: input.outcome,
            outcome_count: 0,
            success_count: 0,
            created_at: from_millis(to_millis(now_utc())),
            expires_at: None,
            deleted_at: None,
        };

        let _write = self.write_lock.lock().await;
        self.admit(&record.owner_id, record.size_bytes).await?;

        let stored = if tier == MemoryTier::Ltm {
            if !self.ltm.insert(&record).await? {
                return Err(MemoryError::ConcurrentPromotionConflict { id: record.id });
            }
            record
        } else {
            let evicted = self.cache.put(record.clone()).await?;
            if !evicted.is_empty() {
                tracing::debug!(owner = %record.owner_id, evicted = evicted.len(), "store evicted cached memories");
            }
            self.cache.get(&record.id).await.unwrap_or(record)
        };

        tracing::debug!(
            id = %stored.id,
            owner = %stored.owner_id,
            tier = %stored.tier,
            embedded = stored.embedding.is_some(),
            valid = stored.constitutional_valid,
            "memory stored"
        );
        Ok(stored)
    }

    /// Fetch a record and count the access
    pub async fn retrieve(&self, owner_id: &str, id: &str) -> MemoryResult<MemoryRecord> {
        match self.cache.get(id).await {
            Ok(record) => {
                ensure_owner(&record, owner_id)?;
                self.cache.touch(id).await
            }
            Err(e) if e.is_not_found() => self.ltm.record_access(owner_id, id).await,
            Err(e) => Err(e),
        }
    }

    /// An owner's records across tiers in creation order
    pub async fn list(
        &self,
        owner_id: &str,
        tier: Option<MemoryTier>,
        limit: usize,
        offset: usize,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        let mut records = match tier {
            Some(MemoryTier::Ltm) => Vec::new(),
            cached => self.cache.list(owner_id, cached).await,
        };
        if tier.is_none_or(|t| t == MemoryTier::Ltm) {
            let mut ltm = self.ltm.list(owner_id, None, false).await?;
            ltm.reverse();
            records.extend(ltm);
        }

        // Stable: equal timestamps keep cache insertion order
        records.sort_by_key(|record| record.created_at);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    /// Similarity search over every tier; keyword matching covers records
    /// (or queries) without an embedding
    pub async fn search(&self, query: &SearchQuery) -> MemoryResult<Vec<ScoredMemory>> {
        let query_embedding = self.embeddings.generate_or_none(&query.query_text).await;

        let mut results: Vec<ScoredMemory> = match query.tier_filter {
            Some(MemoryTier::Ltm) => Vec::new(),
            tier => self
                .cache
                .list(&query.owner_id, tier)
                .await
                .into_iter()
                .filter(|record| query.min_confidence.is_none_or(|min| record.confidence_score >= min))
                .filter_map(|record| score_candidate(record, &query.query_text, query_embedding.as_deref()))
                .collect(),
        };
        results.extend(self.ltm.search(query, query_embedding.as_deref()).await?);

        rank_scored(&mut results);
        results.truncate(query.limit);
        Ok(results)
    }

    /// Patch a cached record, or move it with `patch.tier`.
    ///
    /// LTM content is immutable; patching it is an invalid operation.
    pub async fn update(&self, owner_id: &str, id: &str, patch: MemoryPatch) -> MemoryResult<MemoryRecord> {
        let current = match self.cache.get(id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let record = self.ltm.get(owner_id, id, false).await?;
                if patch.touches_content() {
                    return Err(MemoryError::invalid_operation("long-term memories are immutable"));
                }
                return match patch.tier {
                    None | Some(MemoryTier::Ltm) => Ok(record),
                    Some(target) => Err(MemoryError::rule_violation(format!(
                        "cannot move a record from ltm to {}",
                        target
                    ))),
                };
            }
            Err(e) => return Err(e),
        };
        ensure_owner(&current, owner_id)?;

        let mut record = current.clone();
        if patch.touches_content() {
            patch.apply_to(&mut record);
            if !(-1.0..=1.0).contains(&record.emotional_weight) || !(0.0..=1.0).contains(&record.confidence_score) {
                return Err(MemoryError::invalid_operation("score out of range"));
            }
            let dims = record.embedding.as_ref().map_or(0, Vec::len);
            record.size_bytes = estimate_size(&record.text, &record.tags, dims);

            let _write = self.write_lock.lock().await;
            if record.size_bytes > current.size_bytes {
                self.admit(owner_id, record.size_bytes - current.size_bytes).await?;
            }
            record = self.cache.update(record).await?;
        }

        match patch.tier {
            Some(target) if target != record.tier => match self.promote(owner_id, id, target).await? {
                PromotionOutcome::Promoted { record, .. } | PromotionOutcome::AlreadyPromoted { record } => Ok(record),
                PromotionOutcome::Deferred { reason, .. } => {
                    tracing::info!(id, "tier change deferred: {}", reason);
                    Ok(record)
                }
                PromotionOutcome::Blocked { violations, .. } => {
                    Err(MemoryError::ConstitutionalViolation { categories: violations })
                }
                PromotionOutcome::NotEligible { failed, .. } => Err(MemoryError::rule_violation(failed.join("; "))),
            },
            _ => Ok(record),
        }
    }

    /// Remove a cached record, or soft-delete a long-term one
    pub async fn delete(&self, owner_id: &str, id: &str) -> MemoryResult<()> {
        match self.cache.get(id).await {
            Ok(record) => {
                ensure_owner(&record, owner_id)?;
                self.cache.remove(id).await?;
                tracing::debug!(id, owner = owner_id, tier = %record.tier, "cached memory deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => self.ltm.soft_delete(owner_id, id).await,
            Err(e) => Err(e),
        }
    }

    /// Request a tier transition; criteria still apply
    pub async fn promote(&self, owner_id: &str, id: &str, target: MemoryTier) -> MemoryResult<PromotionOutcome> {
        self.promotion.promote(owner_id, id, target).await
    }

    /// Let the decision function move a record wherever it qualifies
    pub async fn evaluate_promotion(&self, owner_id: &str, id: &str) -> MemoryResult<PromotionOutcome> {
        self.promotion.evaluate(owner_id, id).await
    }

    /// `expire_sweep()`: STM past its TTL gets a promotion decision first,
    /// then every expired cached record is dropped
    pub async fn expire_sweep(&self) -> MemoryResult<usize> {
        for (id, outcome) in self.promotion.promote_aged().await {
            match outcome {
                Ok(outcome) => tracing::debug!(id = %id, ?outcome, "aged record evaluated"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.cache.expire_sweep().await
    }

    /// Validate text. Invalid content referencing a cached memory flags it so
    /// it cannot be promoted.
    pub async fn validate(&self, text: &str, context: &ValidationContext) -> MemoryResult<ValidationResult> {
        let result = self.validate_with_timeout(text, context).await?;
        if !result.valid {
            if let Some(memory_id) = &context.memory_id {
                self.promotion.mark_invalid(memory_id).await;
            }
        }
        Ok(result)
    }

    /// Per-tier counts and stored bytes for an owner
    pub async fn stats(&self, owner_id: &str) -> MemoryResult<MemoryStats> {
        let (ltm_count, ltm_bytes, soft_deleted) = self.ltm.stats(owner_id).await?;

        let mut stats = MemoryStats {
            storage_size_bytes: self.cache.owner_usage(owner_id).await + ltm_bytes,
            soft_deleted,
            ..Default::default()
        };
        for tier in [MemoryTier::Stm, MemoryTier::Itm] {
            stats.count_by_tier.insert(tier, self.cache.count(owner_id, tier).await);
        }
        stats.count_by_tier.insert(MemoryTier::Ltm, ltm_count);
        Ok(stats)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Task contracts
    // ─────────────────────────────────────────────────────────────────────────

    /// `distillation_run(owner_scope?)`
    pub async fn distillation_run(&self, owner_scope: Option<&str>) -> MemoryResult<DistillationReport> {
        self.distillation.run(owner_scope).await
    }

    /// `reflection_task(memory_id)`; redelivery returns the stored reflection
    pub async fn reflection_task(&self, memory_id: &str) -> MemoryResult<ReflectionRecord> {
        let record = match self.cache.get(memory_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => self.ltm.find(memory_id).await?.ok_or(e)?,
            Err(e) => return Err(e),
        };

        ReflectionTask::new(self.reflections.clone(), Arc::clone(&self.validator), self.validation_timeout)
            .run(&record)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn validate_with_timeout(&self, text: &str, context: &ValidationContext) -> MemoryResult<ValidationResult> {
        match tokio::time::timeout(self.validation_timeout, self.validator.validate_content(text, context)).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::validation_unavailable(format!(
                "timed out after {}ms",
                self.validation_timeout.as_millis()
            ))),
        }
    }

    /// Quota gate; callers hold `write_lock`
    async fn admit(&self, owner_id: &str, requested: u64) -> MemoryResult<()> {
        let limits = self.quota.limits_for(owner_id).await?;
        let used = self.cache.owner_usage(owner_id).await + self.ltm.usage(owner_id).await?;
        check_quota(owner_id, used, requested, limits.max_bytes, self.config.quota.warn_ratio)?;
        Ok(())
    }
}

fn wire(
    config: &EngineConfig,
    cache: &Arc<TieredCache>,
    ltm: &LongTermStore,
    validator: &Arc<dyn ConstitutionalValidator>,
    embeddings: &EmbeddingGenerator,
    reflections: &ReflectionStore,
    knowledge: &KnowledgeStore,
) -> (Arc<PromotionEngine>, DistillationJob) {
    let promotion = Arc::new(PromotionEngine::new(
        Arc::clone(cache),
        ltm.clone(),
        Arc::clone(validator),
        config.promotion.clone(),
        &config.cache,
        &config.policy,
    ));
    let distillation = DistillationJob::new(
        reflections.clone(),
        knowledge.clone(),
        ltm.clone(),
        Arc::clone(cache),
        Arc::clone(&promotion),
        embeddings.clone(),
        config.distillation.clone(),
    );
    (promotion, distillation)
}

fn ensure_owner(record: &MemoryRecord, owner_id: &str) -> MemoryResult<()> {
    if record.owner_id != owner_id {
        return Err(MemoryError::forbidden(owner_id, &record.id));
    }
    Ok(())
}

fn validate_input(input: &StoreMemoryInput) -> MemoryResult<()> {
    if input.owner_id.trim().is_empty() {
        return Err(MemoryError::invalid_operation("owner_id is required"));
    }
    if input.text.trim().is_empty() {
        return Err(MemoryError::invalid_operation("text must not be empty"));
    }
    if input.emotional_weight.is_some_and(|w| !(-1.0..=1.0).contains(&w)) {
        return Err(MemoryError::invalid_operation("emotional_weight must be within [-1, 1]"));
    }
    if input.confidence_score.is_some_and(|c| !(0.0..=1.0).contains(&c)) {
        return Err(MemoryError::invalid_operation("confidence_score must be within [0, 1]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingBackend, EmbeddingConfig, PolicyConfig};
    use crate::distillation::DistillationStatus;
    use crate::memory::{HashedEmbedder, MemoryKind, QuotaLimits};
    use crate::policy::AlignmentResult;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn test_config() -> EngineConfig {
        EngineConfig::default().with_embedding(EmbeddingConfig {
            backend: EmbeddingBackend::Hashed,
            dimensions: 64,
            timeout_ms: 1000,
        })
    }

    async fn engine() -> MemoryEngine {
        MemoryEngine::open_in_memory(test_config()).await.unwrap()
    }

    /// Accepts everything with a fixed score
    struct FixedValidator(f32);

    #[async_trait]
    impl ConstitutionalValidator for FixedValidator {
        async fn validate_content(&self, _text: &str, _context: &ValidationContext) -> MemoryResult<ValidationResult> {
            Ok(ValidationResult {
                valid: true,
                score: self.0,
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
            Ok(AlignmentResult {
                aligned: true,
                score: self.0,
                principle_scores: Default::default(),
                consistent: true,
                concerns: vec![],
                audit_entry_id: None,
            })
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> MemoryResult<Vec<f32>> {
            Err(MemoryError::embedding_unavailable("model not loaded"))
        }

        fn dimensions(&self) -> usize {
            64
        }

        fn model_name(&self) -> &str {
            "down"
        }
    }

    fn file_config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            database_path: dir.path().join("nova.db"),
            ..test_config()
        }
    }

    struct FixedQuota(u64);

    #[async_trait]
    impl QuotaAuthority for FixedQuota {
        async fn limits_for(&self, _owner_id: &str) -> MemoryResult<QuotaLimits> {
            Ok(QuotaLimits { max_bytes: Some(self.0) })
        }
    }

    #[tokio::test]
    async fn test_store_then_retrieve_round_trip() {
        let engine = engine().await;
        let stored = engine
            .store(StoreMemoryInput::new("alice", "User prefers dark mode", MemoryKind::Conversation).with_session("s1"))
            .await
            .unwrap();

        assert_eq!(stored.tier, MemoryTier::Stm);
        assert!(stored.embedding.is_some());
        assert_eq!(stored.confidence_score, DEFAULT_CONFIDENCE);
        let horizon = chrono::Duration::seconds(engine.config().cache.stm_ttl_secs as i64);
        assert!(stored.expires_at.unwrap() <= stored.created_at + horizon);

        let fetched = engine.retrieve("alice", &stored.id).await.unwrap();
        assert_eq!(fetched.text, "User prefers dark mode");
        assert_eq!(fetched.tier, MemoryTier::Stm);
        assert_eq!(fetched.owner_id, "alice");
        assert_eq!(fetched.access_count, 1);
    }

    #[tokio::test]
    async fn test_cross_owner_access_forbidden() {
        let engine = engine().await;
        let stored = engine
            .store(StoreMemoryInput::new("alice", "private note", MemoryKind::Lesson))
            .await
            .unwrap();

        assert!(engine.retrieve("bob", &stored.id).await.unwrap_err().is_forbidden());
        assert!(engine.delete("bob", &stored.id).await.unwrap_err().is_forbidden());
        assert!(engine.retrieve("alice", "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_accessed_itm_memory_promotes_to_ltm() {
        let engine = engine().await.with_validator(Arc::new(FixedValidator(0.85)));
        let stored = engine
            .store(
                StoreMemoryInput::new("alice", "I will never give up", MemoryKind::Lesson)
                    .with_tier(MemoryTier::Itm)
                    .with_emotional_weight(0.6)
                    .with_confidence(0.8),
            )
            .await
            .unwrap();
        for _ in 0..3 {
            engine.retrieve("alice", &stored.id).await.unwrap();
        }

        let outcome = engine.promote("alice", &stored.id, MemoryTier::Ltm).await.unwrap();
        let record = outcome.ltm_record().unwrap();
        assert_eq!(record.tier, MemoryTier::Ltm);
        assert!(record.access_count >= 3);
        assert_eq!(record.id, stored.id);

        let stats = engine.stats("alice").await.unwrap();
        assert_eq!(stats.count_by_tier[&MemoryTier::Ltm], 1);
        assert_eq!(stats.count_by_tier[&MemoryTier::Itm], 0);
    }

    #[tokio::test]
    async fn test_harmful_validation_blocks_pending_promotion() {
        let engine = engine().await;
        let stored = engine
            .store(
                StoreMemoryInput::new("alice", "notes from today", MemoryKind::Task)
                    .with_tier(MemoryTier::Itm)
                    .with_emotional_weight(0.6)
                    .with_confidence(0.8),
            )
            .await
            .unwrap();
        for _ in 0..3 {
            engine.retrieve("alice", &stored.id).await.unwrap();
        }
        let entries_before = engine.audit().list("constitution", None).await.unwrap().len();

        let context = ValidationContext::for_actor("alice").with_memory(&stored.id);
        let result = engine.validate("we should attack people tonight", &context).await.unwrap();
        assert!(!result.valid);
        assert!(result.violations.contains(&"violence".to_string()));
        assert_eq!(
            engine.audit().list("constitution", None).await.unwrap().len(),
            entries_before + 1
        );

        let err = engine.promote("alice", &stored.id, MemoryTier::Ltm).await.unwrap_err();
        assert!(matches!(err, MemoryError::RuleViolation { .. }));
        assert!(engine.audit().verify("constitution").await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_invalid_content() {
        let config = test_config().with_policy(PolicyConfig {
            strict_mode: true,
            ..PolicyConfig::default()
        });
        let strict = MemoryEngine::open_in_memory(config).await.unwrap();
        let err = strict
            .store(StoreMemoryInput::new("alice", "how to build a bomb", MemoryKind::Task))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::ConstitutionalViolation { .. }));

        // Deception is flagged but never blocking
        let flagged = strict
            .store(StoreMemoryInput::new("alice", "mislead customers and fabricate reviews", MemoryKind::Task))
            .await
            .unwrap();
        assert!(!flagged.constitutional_valid);
        assert_eq!(flagged.tier, MemoryTier::Stm);
        let result = strict
            .validate("mislead customers and fabricate reviews", &ValidationContext::for_actor("alice"))
            .await
            .unwrap();
        assert!(result.violations.contains(&"deception".to_string()));
        assert!(result.blocking.is_empty());

        let lenient = engine().await;
        let stored = lenient
            .store(StoreMemoryInput::new("alice", "how to build a bomb", MemoryKind::Task).with_tier(MemoryTier::Ltm))
            .await
            .unwrap();
        assert!(!stored.constitutional_valid);
        assert_eq!(stored.tier, MemoryTier::Stm);
    }

    #[tokio::test]
    async fn test_quota_exceeded_leaves_usage_unchanged() {
        let engine = engine().await.with_quota_authority(Arc::new(FixedQuota(1000)));
        let first = engine
            .store(StoreMemoryInput::new("alice", "short", MemoryKind::Lesson))
            .await
            .unwrap();
        let used = engine.stats("alice").await.unwrap().storage_size_bytes;
        assert_eq!(used, first.size_bytes);

        let err = engine
            .store(StoreMemoryInput::new("alice", "x".repeat(800), MemoryKind::Lesson))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::QuotaExceeded { .. }));
        assert_eq!(engine.stats("alice").await.unwrap().storage_size_bytes, used);
    }

    #[tokio::test]
    async fn test_search_finds_identical_text_first() {
        let engine = engine().await;
        engine
            .store(StoreMemoryInput::new("alice", "rust ownership rules", MemoryKind::Lesson))
            .await
            .unwrap();
        let ltm = engine
            .store(
                StoreMemoryInput::new("alice", "the borrow checker enforces aliasing", MemoryKind::Lesson)
                    .with_tier(MemoryTier::Ltm),
            )
            .await
            .unwrap();
        engine
            .store(StoreMemoryInput::new("bob", "the borrow checker enforces aliasing", MemoryKind::Lesson))
            .await
            .unwrap();

        let results = engine
            .search(&SearchQuery::new("alice", "the borrow checker enforces aliasing"))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].record.id, ltm.id);
        assert!((results[0].score - 1.0).abs() < 1e-4);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_ltm_is_immutable_and_soft_deleted() {
        let engine = engine().await;
        let stored = engine
            .store(StoreMemoryInput::new("alice", "durable lesson", MemoryKind::Lesson).with_tier(MemoryTier::Ltm))
            .await
            .unwrap();

        let patch = MemoryPatch {
            confidence_score: Some(0.9),
            ..Default::default()
        };
        let err = engine.update("alice", &stored.id, patch).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidOperation { .. }));

        engine.delete("alice", &stored.id).await.unwrap();
        assert!(engine.retrieve("alice", &stored.id).await.unwrap_err().is_not_found());
        assert_eq!(engine.stats("alice").await.unwrap().soft_deleted, 1);
    }

    #[tokio::test]
    async fn test_update_cached_record_and_list_order() {
        let engine = engine().await;
        let mut ids = Vec::new();
        for text in ["first", "second", "third"] {
            let record = engine
                .store(StoreMemoryInput::new("alice", text, MemoryKind::Conversation).with_session("s1"))
                .await
                .unwrap();
            ids.push(record.id);
        }

        let patch = MemoryPatch {
            tags: Some(vec!["ui".into()]),
            ..Default::default()
        };
        let updated = engine.update("alice", &ids[1], patch).await.unwrap();
        assert!(updated.tags.contains("ui"));

        let listed = engine.list("alice", Some(MemoryTier::Stm), 10, 0).await.unwrap();
        assert_eq!(listed.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), ids);

        let page = engine.list("alice", None, 1, 1).await.unwrap();
        assert_eq!(page[0].id, ids[1]);
    }

    #[tokio::test]
    async fn test_distillation_without_reflections_completes() {
        let engine = engine().await;
        let report = engine.distillation_run(None).await.unwrap();
        assert_eq!(report.status, DistillationStatus::Completed);
        assert_eq!(report.distilled_created, 0);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_reflections_feed_distillation() {
        let engine = engine().await;
        for text in ["practice daily", "review mistakes weekly"] {
            let record = engine
                .store(StoreMemoryInput::new("alice", text, MemoryKind::Lesson).with_tags(["habits"]))
                .await
                .unwrap();
            let reflection = engine.reflection_task(&record.id).await.unwrap();
            assert_eq!(reflection.topic_key, "habits");
            assert!(reflection.aligned);

            let again = engine.reflection_task(&record.id).await.unwrap();
            assert_eq!(again.id, reflection.id);
        }

        // The window is half-open at run start
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = engine.distillation_run(Some("alice")).await.unwrap();
        assert_eq!(report.reflections_scanned, 2);
        assert_eq!(report.distilled_created, 1);

        let distilled = engine.knowledge().list("alice").await.unwrap();
        assert_eq!(distilled[0].source_reflection_ids.len(), 2);
        let memory = engine.retrieve("alice", &distilled[0].id).await.unwrap();
        assert_eq!(memory.kind, MemoryKind::Distilled);
    }

    #[tokio::test]
    async fn test_file_backed_engine_reopens() {
        let dir = TempDir::new().unwrap();
        let config = file_config(&dir);

        let id = {
            let engine = MemoryEngine::open(config.clone()).await.unwrap();
            engine
                .store(StoreMemoryInput::new("alice", "kept across restarts", MemoryKind::Lesson).with_tier(MemoryTier::Ltm))
                .await
                .unwrap()
                .id
        };

        let engine = MemoryEngine::open(config).await.unwrap();
        assert_eq!(engine.active_policy().version, 1);
        assert_eq!(engine.retrieve("alice", &id).await.unwrap().text, "kept across restarts");
    }

    #[tokio::test]
    async fn test_cached_tiers_survive_reopen() {
        let dir = TempDir::new().unwrap();

        let (stm_id, itm_id) = {
            let engine = MemoryEngine::open(file_config(&dir)).await.unwrap();
            let stm = engine
                .store(StoreMemoryInput::new("alice", "remember the blue door", MemoryKind::Conversation).with_session("s1"))
                .await
                .unwrap();
            let itm = engine
                .store(StoreMemoryInput::new("alice", "weekly standup on monday", MemoryKind::Task).with_tier(MemoryTier::Itm))
                .await
                .unwrap();
            engine.retrieve("alice", &itm.id).await.unwrap();
            (stm.id, itm.id)
        };

        // Each command opens its own engine
        {
            let engine = MemoryEngine::open(file_config(&dir)).await.unwrap();
            let stm = engine.retrieve("alice", &stm_id).await.unwrap();
            assert_eq!(stm.text, "remember the blue door");
            assert_eq!(stm.tier, MemoryTier::Stm);
            assert_eq!(stm.access_count, 1);
            assert_eq!(engine.reflection_task(&stm_id).await.unwrap().source_memory_id, stm_id);
        }

        let engine = MemoryEngine::open(file_config(&dir)).await.unwrap();
        assert_eq!(engine.retrieve("alice", &stm_id).await.unwrap().access_count, 2);
        assert_eq!(engine.retrieve("alice", &itm_id).await.unwrap().access_count, 2);
        let stats = engine.stats("alice").await.unwrap();
        assert_eq!(stats.count_by_tier[&MemoryTier::Stm], 1);
        assert_eq!(stats.count_by_tier[&MemoryTier::Itm], 1);

        engine.delete("alice", &stm_id).await.unwrap();
        let reopened = MemoryEngine::open(file_config(&dir)).await.unwrap();
        assert!(reopened.retrieve("alice", &stm_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stm_outliving_ttl_promotes_to_itm() {
        let mut config = test_config();
        config.cache.stm_ttl_secs = 1;
        let engine = MemoryEngine::open_in_memory(config).await.unwrap();
        let stored = engine
            .store(StoreMemoryInput::new("alice", "the deploy key rotates monthly", MemoryKind::Lesson))
            .await
            .unwrap();
        let other = engine
            .store(StoreMemoryInput::new("alice", "lunch was fine", MemoryKind::Conversation))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(engine.retrieve("alice", &stored.id).await.unwrap_err().is_not_found());

        match engine.evaluate_promotion("alice", &stored.id).await.unwrap() {
            PromotionOutcome::Promoted { record, from } => {
                assert_eq!(from, MemoryTier::Stm);
                assert_eq!(record.tier, MemoryTier::Itm);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // The sweep moves the other aged record before dropping anything
        assert_eq!(engine.expire_sweep().await.unwrap(), 0);
        assert_eq!(engine.retrieve("alice", &other.id).await.unwrap().tier, MemoryTier::Itm);
        assert_eq!(engine.stats("alice").await.unwrap().count_by_tier[&MemoryTier::Itm], 2);
    }

    #[tokio::test]
    async fn test_evaluate_promotion_checks_ltm_owner() {
        let engine = engine().await;
        let stored = engine
            .store(StoreMemoryInput::new("alice", "durable lesson", MemoryKind::Lesson).with_tier(MemoryTier::Ltm))
            .await
            .unwrap();

        assert!(engine.evaluate_promotion("bob", &stored.id).await.unwrap_err().is_forbidden());
        assert!(matches!(
            engine.evaluate_promotion("alice", &stored.id).await.unwrap(),
            PromotionOutcome::AlreadyPromoted { .. }
        ));
    }

    #[tokio::test]
    async fn test_unembedded_records_match_on_keywords() {
        let engine = engine().await.with_embedder(Arc::new(DownEmbedder));
        let stored = engine
            .store(StoreMemoryInput::new("alice", "rust borrow checker lesson", MemoryKind::Lesson))
            .await
            .unwrap();
        assert!(stored.embedding.is_none());

        let engine = engine.with_embedder(Arc::new(HashedEmbedder::new(64)));
        let hits = engine.search(&SearchQuery::new("alice", "borrow checker")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, stored.id);
        assert_eq!(hits[0].matched_by, crate::memory::MatchKind::Keyword);
    }

    #[tokio::test]
    async fn test_custom_embedder_is_used() {
        let engine = engine().await.with_embedder(Arc::new(HashedEmbedder::new(8)));
        let stored = engine
            .store(StoreMemoryInput::new("alice", "tiny vectors", MemoryKind::Lesson))
            .await
            .unwrap();
        assert_eq!(stored.embedding.unwrap().len(), 8);
    }
}
