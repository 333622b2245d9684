//! Engine Configuration
//!
//! Defines configuration options for the memory engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Engine configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Tiered cache configuration (STM / ITM)
    pub cache: CacheConfig,

    /// Promotion thresholds
    pub promotion: PromotionConfig,

    /// Embedding generation
    pub embedding: EmbeddingConfig,

    /// Policy validation and audit
    pub policy: PolicyConfig,

    /// Distillation job
    pub distillation: DistillationConfig,

    /// Quota plans
    pub quota: QuotaConfig,

    /// Persistence retry behaviour
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("nova.db"),
            cache: CacheConfig::default(),
            promotion: PromotionConfig::default(),
            embedding: EmbeddingConfig::default(),
            policy: PolicyConfig::default(),
            distillation: DistillationConfig::default(),
            quota: QuotaConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Tiered cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Short-term memory TTL in seconds (default: 3600 = 1 hour)
    pub stm_ttl_secs: u64,

    /// Maximum STM records kept per session (default: 20)
    pub stm_max_per_session: usize,

    /// Intermediate-term sliding TTL in seconds (default: 604800 = 7 days)
    pub itm_ttl_secs: u64,

    /// Maximum ITM records kept per owner (default: 100)
    pub itm_max_per_owner: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stm_ttl_secs: 3600, // 1 hour
            stm_max_per_session: 20,
            itm_ttl_secs: 604_800, // 7 days
            itm_max_per_owner: 100,
        }
    }
}

/// Promotion thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Access count that moves a record from STM to ITM (default: 2)
    pub stm_access_threshold: u32,

    /// Access count required for ITM -> LTM (default: 3)
    pub ltm_access_threshold: u32,

    /// |emotional_weight| must exceed this (default: 0.3)
    pub emotional_weight_threshold: f32,

    /// confidence_score must exceed this (default: 0.7)
    pub confidence_threshold: f32,

    /// success rate must exceed this (default: 0.5)
    pub success_rate_threshold: f32,

    /// Confidence at which STM may jump straight to LTM (default: 0.9)
    pub direct_ltm_confidence: f32,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            stm_access_threshold: 2,
            ltm_access_threshold: 3,
            emotional_weight_threshold: 0.3,
            confidence_threshold: 0.7,
            success_rate_threshold: 0.5,
            direct_ltm_confidence: 0.9,
        }
    }
}

/// Embedding backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Local all-MiniLM-L6-v2 via fastembed
    Fastembed,
    /// Deterministic feature hashing, no model download
    Hashed,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Backend used to generate vectors
    pub backend: EmbeddingBackend,

    /// Vector dimensions (default: 384)
    pub dimensions: usize,

    /// Upper bound for a single embedding call in milliseconds
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: if cfg!(feature = "embeddings") {
                EmbeddingBackend::Fastembed
            } else {
                EmbeddingBackend::Hashed
            },
            dimensions: 384,
            timeout_ms: 5000,
        }
    }
}

/// Policy validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Audit lineage the validator appends to
    pub lineage: String,

    /// Reject invalid content on write instead of flagging it
    pub strict_mode: bool,

    /// Minimum score for an alignment to count as aligned (default: 0.7)
    pub alignment_threshold: f32,

    /// Upper bound for a validation call in milliseconds
    pub timeout_ms: u64,

    /// Key mixed into audit signatures
    pub signing_key: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lineage: "constitution".to_string(),
            strict_mode: false,
            alignment_threshold: 0.7,
            timeout_ms: 2000,
            signing_key: "nova-local-signing-key".to_string(),
        }
    }
}

/// Distillation job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillationConfig {
    /// Minimum reflections in a topic group (default: 2)
    pub min_group_size: usize,

    /// Half-life for recency weighting in hours (default: 24)
    pub recency_half_life_hours: f64,

    /// Window used when no checkpoint exists yet (default: 24)
    pub initial_lookback_hours: i64,

    /// Score gap beyond which older distilled knowledge is contradicted
    pub contradiction_margin: f32,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            min_group_size: 2,
            recency_half_life_hours: 24.0,
            initial_lookback_hours: 24,
            contradiction_margin: 0.25,
        }
    }
}

/// Quota plans: plan name -> byte limit (-1 = unlimited)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Plan applied to owners without an explicit assignment
    pub default_plan: String,

    /// Byte limit per plan
    pub plans: BTreeMap<String, i64>,

    /// Explicit owner -> plan assignments
    pub owners: BTreeMap<String, String>,

    /// Fraction of the limit that triggers a warning (default: 0.8)
    pub warn_ratio: f64,
}

const GIB: i64 = 1024 * 1024 * 1024;

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut plans = BTreeMap::new();
        plans.insert("free".to_string(), GIB);
        plans.insert("basic".to_string(), 10 * GIB);
        plans.insert("pro".to_string(), -1);

        Self {
            default_plan: "free".to_string(),
            plans,
            owners: BTreeMap::new(),
            warn_ratio: 0.8,
        }
    }
}

/// Persistence retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Attempts before a transient failure becomes fatal (default: 3)
    pub max_attempts: u32,

    /// First backoff delay in milliseconds, doubled per attempt
    pub base_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given database path
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Default::default()
        }
    }

    /// Set cache configuration
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set promotion thresholds
    pub fn with_promotion(mut self, promotion: PromotionConfig) -> Self {
        self.promotion = promotion;
        self
    }

    /// Set embedding configuration
    pub fn with_embedding(mut self, embedding: EmbeddingConfig) -> Self {
        self.embedding = embedding;
        self
    }

    /// Set policy configuration
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Set distillation configuration
    pub fn with_distillation(mut self, distillation: DistillationConfig) -> Self {
        self.distillation = distillation;
        self
    }

    /// Set quota configuration
    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.cache.stm_ttl_secs == 0 {
            return Err(invalid("cache.stm_ttl_secs", "must be greater than 0"));
        }

        if self.cache.itm_ttl_secs < self.cache.stm_ttl_secs {
            return Err(invalid(
                "cache.itm_ttl_secs",
                "must not be shorter than cache.stm_ttl_secs",
            ));
        }

        if self.cache.stm_max_per_session == 0 || self.cache.itm_max_per_owner == 0 {
            return Err(invalid("cache", "tier capacities must be greater than 0"));
        }

        for (field, value) in [
            ("promotion.emotional_weight_threshold", self.promotion.emotional_weight_threshold),
            ("promotion.confidence_threshold", self.promotion.confidence_threshold),
            ("promotion.success_rate_threshold", self.promotion.success_rate_threshold),
            ("promotion.direct_ltm_confidence", self.promotion.direct_ltm_confidence),
            ("policy.alignment_threshold", self.policy.alignment_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "must be between 0 and 1"));
            }
        }

        if self.embedding.dimensions == 0 {
            return Err(invalid("embedding.dimensions", "must be greater than 0"));
        }

        if self.policy.lineage.is_empty() {
            return Err(ConfigValidationError::MissingLineage);
        }

        if self.distillation.min_group_size == 0 {
            return Err(invalid("distillation.min_group_size", "must be greater than 0"));
        }

        if self.distillation.recency_half_life_hours <= 0.0 {
            return Err(invalid(
                "distillation.recency_half_life_hours",
                "must be greater than 0",
            ));
        }

        if !self.quota.plans.contains_key(&self.quota.default_plan) {
            return Err(invalid("quota.default_plan", "must name a configured plan"));
        }

        if self.storage.max_attempts == 0 {
            return Err(invalid("storage.max_attempts", "must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("policy.lineage is required")]
    MissingLineage,

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.stm_ttl_secs, 3600);
        assert_eq!(config.cache.stm_max_per_session, 20);
        assert_eq!(config.cache.itm_ttl_secs, 604_800);
        assert_eq!(config.cache.itm_max_per_owner, 100);
        assert_eq!(config.promotion.ltm_access_threshold, 3);
        assert_eq!(config.embedding.dimensions, 384);
        assert_eq!(config.quota.plans.get("pro"), Some(&-1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("test.db").with_cache(CacheConfig {
            stm_max_per_session: 5,
            ..Default::default()
        });

        assert_eq!(config.database_path, PathBuf::from("test.db"));
        assert_eq!(config.cache.stm_max_per_session, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.cache.stm_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.promotion.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.policy.lineage.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingLineage)
        ));

        let mut config = EngineConfig::default();
        config.quota.default_plan = "enterprise".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"cache": {"stm_ttl_secs": 60}}"#)
            .expect("partial config should deserialize");
        assert_eq!(config.cache.stm_ttl_secs, 60);
        assert_eq!(config.cache.stm_max_per_session, 20);
        assert_eq!(config.policy.lineage, "constitution");
    }
}
