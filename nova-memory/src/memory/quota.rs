//! Storage quota accounting.
//!
//! Quota limits come from an external authority (plan assignments); the
//! engine measures usage itself and refuses writes that would cross the limit.

use async_trait::async_trait;

use crate::config::QuotaConfig;
use crate::{MemoryError, MemoryResult};

/// Fixed per-record overhead: id, owner, timestamps, scores and counters
pub const RECORD_OVERHEAD_BYTES: u64 = 162;

/// Bytes charged per tag on top of its text
const TAG_OVERHEAD_BYTES: u64 = 4;

/// Limits granted to one owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    /// `None` when unlimited
    pub max_bytes: Option<u64>,
}

/// Source of per-owner storage limits
#[async_trait]
pub trait QuotaAuthority: Send + Sync {
    async fn limits_for(&self, owner_id: &str) -> MemoryResult<QuotaLimits>;
}

/// Resolves limits from the configured plan table
pub struct PlanQuotaAuthority {
    config: QuotaConfig,
}

impl PlanQuotaAuthority {
    pub fn new(config: QuotaConfig) -> Self {
        Self { config }
    }

    /// Plan name assigned to an owner
    pub fn plan_for(&self, owner_id: &str) -> &str {
        self.config
            .owners
            .get(owner_id)
            .map(String::as_str)
            .unwrap_or(&self.config.default_plan)
    }
}

#[async_trait]
impl QuotaAuthority for PlanQuotaAuthority {
    async fn limits_for(&self, owner_id: &str) -> MemoryResult<QuotaLimits> {
        let plan = self.plan_for(owner_id);
        let limit = self
            .config
            .plans
            .get(plan)
            .ok_or_else(|| MemoryError::policy(format!("unknown quota plan: {}", plan)))?;

        Ok(QuotaLimits {
            max_bytes: if *limit < 0 { None } else { Some(*limit as u64) },
        })
    }
}

/// Estimated stored size of a record
pub fn estimate_size<'a>(text: &str, tags: impl IntoIterator<Item = &'a String>, dimensions: usize) -> u64 {
    let tag_bytes: u64 = tags
        .into_iter()
        .map(|tag| tag.len() as u64 + TAG_OVERHEAD_BYTES)
        .sum();
    text.len() as u64 + tag_bytes + (dimensions as u64) * 4 + RECORD_OVERHEAD_BYTES
}

/// Outcome of a successful quota check
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCheck {
    pub used: u64,
    pub requested: u64,
    pub limit: Option<u64>,
    /// Usage after the write crosses the warning ratio
    pub near_limit: bool,
}

/// Admit or refuse a write of `requested` bytes
pub fn check_quota(
    owner_id: &str,
    used: u64,
    requested: u64,
    limit: Option<u64>,
    warn_ratio: f64,
) -> MemoryResult<QuotaCheck> {
    let Some(limit) = limit else {
        return Ok(QuotaCheck {
            used,
            requested,
            limit: None,
            near_limit: false,
        });
    };

    let after = used.saturating_add(requested);
    if after > limit {
        return Err(MemoryError::QuotaExceeded {
            owner_id: owner_id.to_string(),
            used,
            requested,
            limit,
        });
    }

    let near_limit = after as f64 >= limit as f64 * warn_ratio;
    if near_limit {
        tracing::warn!(owner = owner_id, used = after, limit, "storage usage near quota");
    }

    Ok(QuotaCheck {
        used,
        requested,
        limit: Some(limit),
        near_limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_size() {
        let tags = vec!["rust".to_string(), "ai".to_string()];
        // 5 text + (4+4) + (2+4) + 3*4 + overhead
        assert_eq!(estimate_size("hello", &tags, 3), 5 + 8 + 6 + 12 + RECORD_OVERHEAD_BYTES);
        assert_eq!(estimate_size("", &Vec::new(), 0), RECORD_OVERHEAD_BYTES);
    }

    #[test]
    fn test_check_quota() {
        assert!(check_quota("o", 0, 500, Some(1000), 0.8).is_ok());
        assert!(check_quota("o", 900, 100, Some(1000), 0.8).unwrap().near_limit);
        assert!(!check_quota("o", 0, 100, Some(1000), 0.8).unwrap().near_limit);
        assert!(check_quota("o", u64::MAX - 1, 100, None, 0.8).is_ok());

        match check_quota("o", 950, 100, Some(1000), 0.8) {
            Err(MemoryError::QuotaExceeded { used, requested, limit, .. }) => {
                assert_eq!((used, requested, limit), (950, 100, 1000));
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plan_authority() {
        let mut config = QuotaConfig::default();
        config.owners.insert("vip".into(), "pro".into());
        config.owners.insert("odd".into(), "enterprise".into());
        let authority = PlanQuotaAuthority::new(config);

        assert_eq!(
            authority.limits_for("anyone").await.unwrap().max_bytes,
            Some(1024 * 1024 * 1024)
        );
        assert_eq!(authority.limits_for("vip").await.unwrap().max_bytes, None);
        assert!(authority.limits_for("odd").await.is_err());
    }
}
