//! Memory Type Definitions
//!
//! Defines the core types for the tiered memory system.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Memory tier (short-term, intermediate-term, long-term)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Stm,
    Itm,
    Ltm,
}

impl MemoryTier {
    /// Convert from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stm" | "short" | "short_term" => Some(Self::Stm),
            "itm" | "intermediate" | "working" => Some(Self::Itm),
            "ltm" | "long" | "long_term" => Some(Self::Ltm),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stm => "stm",
            Self::Itm => "itm",
            Self::Ltm => "ltm",
        }
    }

    /// Whether this tier lives in the in-process cache
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Stm | Self::Itm)
    }

    pub const ALL: [MemoryTier; 3] = [Self::Stm, Self::Itm, Self::Ltm];
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of interaction produced a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Lesson,
    Task,
    Conversation,
    Error,
    Reflection,
    Achievement,
    Distilled,
}

impl MemoryKind {
    /// Convert from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "lesson" => Some(Self::Lesson),
            "task" => Some(Self::Task),
            "conversation" => Some(Self::Conversation),
            "error" => Some(Self::Error),
            "reflection" => Some(Self::Reflection),
            "achievement" => Some(Self::Achievement),
            "distilled" => Some(Self::Distilled),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lesson => "lesson",
            Self::Task => "task",
            Self::Conversation => "conversation",
            Self::Error => "error",
            Self::Reflection => "reflection",
            Self::Achievement => "achievement",
            Self::Distilled => "distilled",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Interaction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    #[default]
    Neutral,
}

impl Outcome {
    /// Convert from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Neutral => "neutral",
        }
    }
}

/// A memory record, regardless of which tier currently holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub owner_id: String,
    pub session_id: Option<String>,
    pub tier: MemoryTier,
    pub kind: MemoryKind,
    pub text: String,
    /// `None` when embedding generation was unavailable; such records are
    /// only reachable through keyword/tag search
    pub embedding: Option<Vec<f32>>,
    pub tags: BTreeSet<String>,
    pub emotional_weight: f32,
    pub confidence_score: f32,
    pub access_count: u32,
    pub constitutional_valid: bool,
    pub outcome: Outcome,
    pub outcome_count: u32,
    pub success_count: u32,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    /// Fraction of recorded outcomes that were successful.
    ///
    /// Records without any recorded outcome fall back to their own outcome:
    /// anything but an explicit failure counts as fully successful.
    pub fn success_rate(&self) -> f32 {
        if self.outcome_count == 0 {
            return match self.outcome {
                Outcome::Failure => 0.0,
                Outcome::Success | Outcome::Neutral => 1.0,
            };
        }
        self.success_count as f32 / self.outcome_count as f32
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Apply an outcome observation to the success-rate counters
    pub fn record_outcome(&mut self, outcome: Outcome) {
        self.outcome = outcome;
        self.outcome_count = self.outcome_count.saturating_add(1);
        if outcome == Outcome::Success {
            self.success_count = self.success_count.saturating_add(1);
        }
    }

    /// Case-insensitive keyword/tag match used when no embedding is available
    pub fn matches_keywords(&self, query: &str) -> f32 {
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        if words.is_empty() {
            return 0.0;
        }

        let text = self.text.to_lowercase();
        let hits = words
            .iter()
            .filter(|w| text.contains(w.as_str()) || self.tags.iter().any(|t| t.to_lowercase() == **w))
            .count();

        hits as f32 / words.len() as f32
    }
}

/// Input for storing a new memory record
#[derive(Debug, Clone)]
pub struct StoreMemoryInput {
    pub owner_id: String,
    pub session_id: Option<String>,
    pub text: String,
    pub kind: MemoryKind,
    /// Target tier; defaults to STM
    pub tier_hint: Option<MemoryTier>,
    pub tags: Vec<String>,
    pub emotional_weight: Option<f32>,
    pub confidence_score: Option<f32>,
    pub outcome: Outcome,
}

impl StoreMemoryInput {
    pub fn new(owner_id: impl Into<String>, text: impl Into<String>, kind: MemoryKind) -> Self {
        Self {
            owner_id: owner_id.into(),
            session_id: None,
            text: text.into(),
            kind,
            tier_hint: None,
            tags: Vec::new(),
            emotional_weight: None,
            confidence_score: None,
            outcome: Outcome::Neutral,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tier(mut self, tier: MemoryTier) -> Self {
        self.tier_hint = Some(tier);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_emotional_weight(mut self, weight: f32) -> Self {
        self.emotional_weight = Some(weight);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence_score = Some(confidence);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Partial update for a memory record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    pub outcome: Option<Outcome>,
    pub emotional_weight: Option<f32>,
    pub confidence_score: Option<f32>,
    pub tags: Option<Vec<String>>,
    pub tier: Option<MemoryTier>,
}

impl MemoryPatch {
    /// True when the patch changes record content, not just tier
    pub fn touches_content(&self) -> bool {
        self.outcome.is_some()
            || self.emotional_weight.is_some()
            || self.confidence_score.is_some()
            || self.tags.is_some()
    }

    /// Apply content fields in place
    pub fn apply_to(&self, record: &mut MemoryRecord) {
        if let Some(outcome) = self.outcome {
            record.record_outcome(outcome);
        }
        if let Some(weight) = self.emotional_weight {
            record.emotional_weight = weight;
        }
        if let Some(confidence) = self.confidence_score {
            record.confidence_score = confidence;
        }
        if let Some(tags) = &self.tags {
            record.tags = tags.iter().cloned().collect();
        }
    }
}

/// Search request over one owner's memories
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub owner_id: String,
    pub query_text: String,
    pub tier_filter: Option<MemoryTier>,
    pub min_confidence: Option<f32>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(owner_id: impl Into<String>, query_text: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            query_text: query_text.into(),
            tier_filter: None,
            min_confidence: None,
            limit: 10,
        }
    }
}

/// How a search result was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Vector,
    Keyword,
}

/// Search hit with its similarity score for caller-side thresholding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    /// Cosine similarity (-1..1) for vector matches, keyword overlap (0..1) otherwise
    pub score: f32,
    pub matched_by: MatchKind,
}

/// Order hits by descending score, then confidence, then recency
pub fn rank_scored(results: &mut [ScoredMemory]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.record.confidence_score.total_cmp(&a.record.confidence_score))
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
    });
}

/// Memory statistics for one owner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub count_by_tier: BTreeMap<MemoryTier, usize>,
    pub storage_size_bytes: u64,
    pub soft_deleted: usize,
}

impl MemoryStats {
    pub fn total(&self) -> usize {
        self.count_by_tier.values().sum()
    }
}
