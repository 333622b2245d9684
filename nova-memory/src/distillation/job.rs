//! Distillation job.
//!
//! A batch pass over recent reflections: group by owner and topic, score each
//! group with recency weighting, write one distilled record per group and
//! materialise it in LTM. The job is safe to re-run; the checkpoint only
//! advances when every step succeeded.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::knowledge::{Checkpoint, DistilledKnowledge, KnowledgeStore};
use super::reflection::{ReflectionRecord, ReflectionStore};
use crate::config::DistillationConfig;
use crate::memory::quota::estimate_size;
use crate::memory::{
    EmbeddingGenerator, LongTermStore, MemoryKind, MemoryRecord, MemoryTier, Outcome, TieredCache,
};
use crate::promotion::{PromotionEngine, PromotionOutcome};
use crate::utils::{from_millis, now_utc, to_millis};
use crate::MemoryResult;

/// Scope key for a run over every owner
pub const GLOBAL_SCOPE: &str = "*";

/// Tag carried by every materialised distilled memory
pub const DISTILLED_TAG: &str = "distilled";

/// Reflections whose improvement answers make up a principle summary
const PRINCIPLE_SOURCES: usize = 3;

const PRINCIPLE_MAX_CHARS: usize = 500;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationStatus {
    /// Every step succeeded and the checkpoint advanced
    Completed,
    /// At least one step failed; the checkpoint did not move
    Partial,
    /// Another run for the same scope was in progress
    Skipped,
}

/// Counters and errors for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillationReport {
    pub run_id: String,
    pub scope: String,
    pub status: DistillationStatus,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub reflections_scanned: usize,
    pub groups: usize,
    pub groups_below_minimum: usize,
    pub distilled_created: usize,
    pub contradicted: usize,
    pub refined: usize,
    pub promotions_attempted: usize,
    pub promoted: usize,
    /// STM records moved on after outliving their TTL
    pub aged_promoted: usize,
    pub expired: usize,
    pub errors: Vec<String>,
}

impl DistillationReport {
    fn new(scope: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            status: DistillationStatus::Completed,
            window_start: None,
            window_end: None,
            reflections_scanned: 0,
            groups: 0,
            groups_below_minimum: 0,
            distilled_created: 0,
            contradicted: 0,
            refined: 0,
            promotions_attempted: 0,
            promoted: 0,
            aged_promoted: 0,
            expired: 0,
            errors: Vec::new(),
        }
    }

    fn fail(&mut self, step: &str, error: impl std::fmt::Display) {
        tracing::warn!(run_id = %self.run_id, step, "distillation step failed: {}", error);
        self.errors.push(format!("{}: {}", step, error));
    }
}

/// Marks a scope as running until dropped
struct RunGuard<'a> {
    running: &'a std::sync::Mutex<HashSet<String>>,
    scope: String,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a std::sync::Mutex<HashSet<String>>, scope: &str) -> Option<Self> {
        let mut set = running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.insert(scope.to_string()).then(|| Self {
            running,
            scope: scope.to_string(),
        })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.scope);
    }
}

/// Recency weight of a reflection `age_hours` old
pub fn recency_weight(age_hours: f64, half_life_hours: f64) -> f64 {
    0.5f64.powf(age_hours.max(0.0) / half_life_hours)
}

/// Recency-weighted mean alignment score of a group
pub fn aggregate_score(group: &[ReflectionRecord], now: DateTime<Utc>, half_life_hours: f64) -> f32 {
    let (weighted, total) = group.iter().fold((0.0f64, 0.0f64), |(weighted, total), reflection| {
        let age_hours = (now - reflection.created_at).num_milliseconds() as f64 / 3_600_000.0;
        let weight = recency_weight(age_hours, half_life_hours);
        (weighted + weight * reflection.alignment_score as f64, total + weight)
    });
    if total <= 0.0 {
        return 0.0;
    }
    (weighted / total).clamp(0.0, 1.0) as f32
}

/// Principle summary from the newest reflections' improvement answers
fn principle_summary(topic: &str, group: &[ReflectionRecord]) -> String {
    let mut answers: Vec<&str> = Vec::new();
    for answer in group.iter().rev().filter_map(ReflectionRecord::improvement) {
        if !answers.contains(&answer) {
            answers.push(answer);
        }
        if answers.len() == PRINCIPLE_SOURCES {
            break;
        }
    }

    if answers.is_empty() {
        return format!("Distilled guidance on {}", topic);
    }
    answers.join("; ").chars().take(PRINCIPLE_MAX_CHARS).collect()
}

/// The `distillation_run(owner_scope?)` contract
pub struct DistillationJob {
    reflections: ReflectionStore,
    knowledge: KnowledgeStore,
    ltm: LongTermStore,
    cache: Arc<TieredCache>,
    promotion: Arc<PromotionEngine>,
    embeddings: EmbeddingGenerator,
    config: DistillationConfig,
    running: std::sync::Mutex<HashSet<String>>,
}

impl DistillationJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reflections: ReflectionStore,
        knowledge: KnowledgeStore,
        ltm: LongTermStore,
        cache: Arc<TieredCache>,
        promotion: Arc<PromotionEngine>,
        embeddings: EmbeddingGenerator,
        config: DistillationConfig,
    ) -> Self {
        Self {
            reflections,
            knowledge,
            ltm,
            cache,
            promotion,
            embeddings,
            config,
            running: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    /// Run once for `owner_scope` (all owners when `None`).
    ///
    /// A run already in progress for the same scope makes this a no-op that
    /// reports [`DistillationStatus::Skipped`].
    pub async fn run(&self, owner_scope: Option<&str>) -> MemoryResult<DistillationReport> {
        let scope = owner_scope.unwrap_or(GLOBAL_SCOPE);
        let mut report = DistillationReport::new(scope);

        let Some(_guard) = RunGuard::acquire(&self.running, scope) else {
            tracing::info!(scope, "distillation already running for scope, skipping");
            report.status = DistillationStatus::Skipped;
            return Ok(report);
        };

        let run_start = from_millis(to_millis(now_utc()));
        let window_start = match self.knowledge.checkpoint(scope).await? {
            Some(checkpoint) => checkpoint.window_end,
            None => run_start - Duration::hours(self.config.initial_lookback_hours),
        };
        report.window_start = Some(window_start);
        report.window_end = Some(run_start);

        let reflections = self.reflections.list_window(owner_scope, window_start, run_start).await?;
        report.reflections_scanned = reflections.len();

        let mut groups: BTreeMap<(String, String), Vec<ReflectionRecord>> = BTreeMap::new();
        for reflection in reflections {
            groups
                .entry((reflection.owner_id.clone(), reflection.topic_key.clone()))
                .or_default()
                .push(reflection);
        }
        report.groups = groups.len();

        for ((owner_id, topic), group) in &groups {
            if group.len() < self.config.min_group_size {
                report.groups_below_minimum += 1;
                continue;
            }
            self.distill_group(owner_id, topic, group, run_start, &mut report).await;
            self.promote_referenced(group, &mut report).await;
        }

        self.promote_aged(&mut report).await;
        match self.cache.expire_sweep().await {
            Ok(expired) => report.expired = expired,
            Err(e) => report.fail("expire", e),
        }

        if report.errors.is_empty() {
            let checkpoint = Checkpoint {
                scope: scope.to_string(),
                window_end: run_start,
                run_id: report.run_id.clone(),
                completed_at: now_utc(),
            };
            match self.knowledge.save_checkpoint(&checkpoint).await {
                Ok(()) => report.status = DistillationStatus::Completed,
                Err(e) => {
                    report.fail("checkpoint", e);
                    report.status = DistillationStatus::Partial;
                }
            }
        } else {
            report.status = DistillationStatus::Partial;
        }

        tracing::info!(
            run_id = %report.run_id,
            scope,
            status = ?report.status,
            reflections = report.reflections_scanned,
            distilled = report.distilled_created,
            contradicted = report.contradicted,
            promoted = report.promoted,
            aged = report.aged_promoted,
            expired = report.expired,
            "distillation run finished"
        );
        Ok(report)
    }

    async fn distill_group(
        &self,
        owner_id: &str,
        topic: &str,
        group: &[ReflectionRecord],
        run_start: DateTime<Utc>,
        report: &mut DistillationReport,
    ) {
        let candidate = DistilledKnowledge {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            topic_key: topic.to_string(),
            aggregate_score: aggregate_score(group, run_start, self.config.recency_half_life_hours),
            principle: principle_summary(topic, group),
            source_reflection_ids: group.iter().map(|r| r.id.clone()).collect(),
            created_at: run_start,
        };

        let (knowledge, created) = match self.knowledge.insert(&candidate).await {
            Ok(stored) => stored,
            Err(e) => return report.fail("distill", e),
        };

        // Insert-or-ignore also repairs a previous run that stopped before this
        let memory = self.materialise(&knowledge).await;
        if let Err(e) = self.ltm.insert(&memory).await {
            return report.fail("materialise", e);
        }

        if created {
            report.distilled_created += 1;
            tracing::debug!(
                owner = owner_id,
                topic,
                sources = knowledge.source_reflection_ids.len(),
                score = knowledge.aggregate_score,
                "distilled knowledge created"
            );
        } else {
            tracing::debug!(owner = owner_id, topic, "group already distilled, resolving again");
        }

        // Repeated on re-runs: a previous attempt may have stopped here
        if let Err(e) = self.resolve_contradictions(&knowledge, report).await {
            report.fail("contradiction", e);
        }
    }

    async fn materialise(&self, knowledge: &DistilledKnowledge) -> MemoryRecord {
        let tags: BTreeSet<String> = [knowledge.topic_key.clone(), DISTILLED_TAG.to_string()].into();
        let embedding = self.embeddings.generate_or_none(&knowledge.principle).await;
        let dims = embedding.as_ref().map_or(0, Vec::len);

        MemoryRecord {
            id: knowledge.id.clone(),
            owner_id: knowledge.owner_id.clone(),
            session_id: None,
            tier: MemoryTier::Ltm,
            kind: MemoryKind::Distilled,
            size_bytes: estimate_size(&knowledge.principle, &tags, dims),
            text: knowledge.principle.clone(),
            embedding,
            tags,
            emotional_weight: 0.0,
            confidence_score: knowledge.aggregate_score,
            access_count: 0,
            constitutional_valid: true,
            outcome: Outcome::Neutral,
            outcome_count: 0,
            success_count: 0,
            created_at: knowledge.created_at,
            expires_at: None,
            deleted_at: None,
        }
    }

    /// Older distilled memories on the same topic yield to a clearly better
    /// one. Soft-deleted records drop out of the listing and each refinement
    /// is keyed by the knowledge id, so running this twice changes nothing.
    async fn resolve_contradictions(
        &self,
        knowledge: &DistilledKnowledge,
        report: &mut DistillationReport,
    ) -> MemoryResult<()> {
        let margin = self.config.contradiction_margin;
        let older = self
            .ltm
            .list(&knowledge.owner_id, Some(MemoryKind::Distilled), false)
            .await?
            .into_iter()
            .filter(|m| m.id != knowledge.id && m.created_at <= knowledge.created_at)
            .filter(|m| m.tags.contains(&knowledge.topic_key));

        for previous in older {
            let gap = knowledge.aggregate_score - previous.confidence_score;
            if gap > margin {
                self.ltm.soft_delete(&previous.owner_id, &previous.id).await?;
                report.contradicted += 1;
                tracing::info!(
                    id = %previous.id,
                    topic = %knowledge.topic_key,
                    old = previous.confidence_score,
                    new = knowledge.aggregate_score,
                    "contradicted distilled memory soft-deleted"
                );
            } else if gap.abs() <= margin {
                let refined = (previous.confidence_score + knowledge.aggregate_score) / 2.0;
                if self
                    .ltm
                    .refine_confidence_once(&previous.owner_id, &previous.id, &knowledge.id, refined)
                    .await?
                {
                    report.refined += 1;
                }
            }
        }
        Ok(())
    }

    /// Give ITM records a group mentions another promotion decision
    async fn promote_referenced(&self, group: &[ReflectionRecord], report: &mut DistillationReport) {
        for reflection in group {
            let id = &reflection.source_memory_id;
            match self.cache.get(id).await {
                Ok(record) if record.tier == MemoryTier::Itm => {}
                _ => continue,
            }

            report.promotions_attempted += 1;
            match self.promotion.evaluate(&reflection.owner_id, id).await {
                Ok(PromotionOutcome::Promoted { record, .. }) if record.tier == MemoryTier::Ltm => {
                    report.promoted += 1;
                }
                Ok(outcome) => tracing::debug!(id = %id, ?outcome, "referenced record not promoted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => report.fail("promote", e),
            }
        }
    }

    /// STM past its TTL gets its promotion decision before the sweep
    async fn promote_aged(&self, report: &mut DistillationReport) {
        for (id, outcome) in self.promotion.promote_aged().await {
            match outcome {
                Ok(PromotionOutcome::Promoted { .. }) => report.aged_promoted += 1,
                Ok(outcome) => tracing::debug!(id = %id, ?outcome, "aged record left to expire"),
                Err(e) if e.is_not_found() => {}
                Err(e) => report.fail("age", e),
            }
        }
    }
}
