//! Pure tier-transition decisions.
//!
//! Nothing here touches storage: the engine snapshots a record, turns it
//! into [`PromotionSignals`] and asks where it should go.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PromotionConfig;
use crate::memory::{MemoryRecord, MemoryTier};

/// Inputs to a promotion decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionSignals {
    pub access_count: u32,
    pub emotional_weight: f32,
    pub confidence_score: f32,
    pub constitutional_valid: bool,
    pub success_rate: f32,
    /// Time spent since creation, in seconds
    pub age_secs: i64,
}

impl PromotionSignals {
    pub fn from_record(record: &MemoryRecord, now: DateTime<Utc>) -> Self {
        Self {
            access_count: record.access_count,
            emotional_weight: record.emotional_weight,
            confidence_score: record.confidence_score,
            constitutional_valid: record.constitutional_valid,
            success_rate: record.success_rate(),
            age_secs: (now - record.created_at).num_seconds().max(0),
        }
    }
}

/// Where a record should move next, if anywhere
pub fn decide(
    tier: MemoryTier,
    signals: &PromotionSignals,
    thresholds: &PromotionConfig,
    stm_ttl: Duration,
) -> Option<MemoryTier> {
    match tier {
        MemoryTier::Stm => {
            if direct_ltm_failures(signals, thresholds).is_empty() {
                Some(MemoryTier::Ltm)
            } else if itm_failures(signals, thresholds, stm_ttl).is_empty() {
                Some(MemoryTier::Itm)
            } else {
                None
            }
        }
        MemoryTier::Itm => ltm_failures(signals, thresholds).is_empty().then_some(MemoryTier::Ltm),
        MemoryTier::Ltm => None,
    }
}

/// Criteria a requested transition fails; empty when it is allowed
pub fn evaluate_transition(
    from: MemoryTier,
    to: MemoryTier,
    signals: &PromotionSignals,
    thresholds: &PromotionConfig,
    stm_ttl: Duration,
) -> Vec<String> {
    match (from, to) {
        (MemoryTier::Stm, MemoryTier::Itm) => itm_failures(signals, thresholds, stm_ttl),
        (MemoryTier::Stm, MemoryTier::Ltm) => direct_ltm_failures(signals, thresholds),
        (MemoryTier::Itm, MemoryTier::Ltm) => ltm_failures(signals, thresholds),
        (from, to) => vec![format!("cannot move a record from {} to {}", from, to)],
    }
}

fn itm_failures(signals: &PromotionSignals, thresholds: &PromotionConfig, stm_ttl: Duration) -> Vec<String> {
    if signals.access_count >= thresholds.stm_access_threshold || signals.age_secs >= stm_ttl.num_seconds() {
        Vec::new()
    } else {
        vec![format!(
            "access_count {} < {} and younger than one STM cycle",
            signals.access_count, thresholds.stm_access_threshold
        )]
    }
}

/// Shared quality gate for anything entering LTM
fn quality_failures(signals: &PromotionSignals, thresholds: &PromotionConfig) -> Vec<String> {
    let mut failed = Vec::new();
    if signals.emotional_weight.abs() <= thresholds.emotional_weight_threshold {
        failed.push(format!(
            "|emotional_weight| {:.2} <= {:.2}",
            signals.emotional_weight.abs(),
            thresholds.emotional_weight_threshold
        ));
    }
    if !signals.constitutional_valid {
        failed.push("not constitutionally valid".to_string());
    }
    if signals.success_rate <= thresholds.success_rate_threshold {
        failed.push(format!(
            "success_rate {:.2} <= {:.2}",
            signals.success_rate, thresholds.success_rate_threshold
        ));
    }
    failed
}

fn ltm_failures(signals: &PromotionSignals, thresholds: &PromotionConfig) -> Vec<String> {
    let mut failed = Vec::new();
    if signals.access_count < thresholds.ltm_access_threshold {
        failed.push(format!(
            "access_count {} < {}",
            signals.access_count, thresholds.ltm_access_threshold
        ));
    }
    if signals.confidence_score <= thresholds.confidence_threshold {
        failed.push(format!(
            "confidence_score {:.2} <= {:.2}",
            signals.confidence_score, thresholds.confidence_threshold
        ));
    }
    failed.extend(quality_failures(signals, thresholds));
    failed
}

fn direct_ltm_failures(signals: &PromotionSignals, thresholds: &PromotionConfig) -> Vec<String> {
    let mut failed = Vec::new();
    if signals.confidence_score < thresholds.direct_ltm_confidence {
        failed.push(format!(
            "confidence_score {:.2} < {:.2} for a direct promotion",
            signals.confidence_score, thresholds.direct_ltm_confidence
        ));
    }
    failed.extend(quality_failures(signals, thresholds));
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> PromotionSignals {
        PromotionSignals {
            access_count: 0,
            emotional_weight: 0.0,
            confidence_score: 0.5,
            constitutional_valid: true,
            success_rate: 1.0,
            age_secs: 0,
        }
    }

    fn decide_default(tier: MemoryTier, signals: &PromotionSignals) -> Option<MemoryTier> {
        decide(tier, signals, &PromotionConfig::default(), Duration::hours(1))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // STM
    // ─────────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_fresh_stm_stays() {
        assert_eq!(decide_default(MemoryTier::Stm, &signals()), None);
    }

    #[test]
    fn test_stm_to_itm_on_access() {
        let s = PromotionSignals { access_count: 2, ..signals() };
        assert_eq!(decide_default(MemoryTier::Stm, &s), Some(MemoryTier::Itm));
    }

    #[test]
    fn test_stm_to_itm_after_one_ttl_cycle() {
        let s = PromotionSignals { age_secs: 3600, ..signals() };
        assert_eq!(decide_default(MemoryTier::Stm, &s), Some(MemoryTier::Itm));
    }

    #[test]
    fn test_stm_direct_to_ltm() {
        let s = PromotionSignals {
            confidence_score: 0.95,
            emotional_weight: -0.5,
            ..signals()
        };
        assert_eq!(decide_default(MemoryTier::Stm, &s), Some(MemoryTier::Ltm));

        let invalid = PromotionSignals { constitutional_valid: false, ..s };
        assert_eq!(decide_default(MemoryTier::Stm, &invalid), None);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // ITM
    // ─────────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_itm_to_ltm_thresholds() {
        let s = PromotionSignals {
            access_count: 3,
            emotional_weight: 0.6,
            confidence_score: 0.8,
            ..signals()
        };
        assert_eq!(decide_default(MemoryTier::Itm, &s), Some(MemoryTier::Ltm));

        // Each criterion on its own blocks the move
        for blocked in [
            PromotionSignals { access_count: 2, ..s },
            PromotionSignals { emotional_weight: 0.3, ..s },
            PromotionSignals { confidence_score: 0.7, ..s },
            PromotionSignals { constitutional_valid: false, ..s },
            PromotionSignals { success_rate: 0.5, ..s },
        ] {
            assert_eq!(decide_default(MemoryTier::Itm, &blocked), None, "{:?}", blocked);
        }
    }

    #[test]
    fn test_ltm_never_moves() {
        let s = PromotionSignals {
            access_count: 100,
            confidence_score: 1.0,
            emotional_weight: 1.0,
            ..signals()
        };
        assert_eq!(decide_default(MemoryTier::Ltm, &s), None);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Explicit transitions
    // ─────────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_evaluate_transition_lists_failures() {
        let failed = evaluate_transition(
            MemoryTier::Itm,
            MemoryTier::Ltm,
            &signals(),
            &PromotionConfig::default(),
            Duration::hours(1),
        );
        assert_eq!(failed.len(), 3);
        assert!(failed[0].starts_with("access_count"));
    }

    #[test]
    fn test_backward_transition_rejected() {
        let failed = evaluate_transition(
            MemoryTier::Ltm,
            MemoryTier::Stm,
            &signals(),
            &PromotionConfig::default(),
            Duration::hours(1),
        );
        assert_eq!(failed, vec!["cannot move a record from ltm to stm"]);
    }
}
