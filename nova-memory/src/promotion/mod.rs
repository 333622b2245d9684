//! Tier Promotion
//!
//! State machine `STM -> ITM -> LTM` plus direct `STM -> LTM` for
//! high-confidence records. [`decide`] is a pure function over a record's
//! signals; [`PromotionEngine`] applies its answer, consulting the
//! constitutional validator before anything reaches LTM.

mod decision;
mod engine;

pub use decision::{PromotionSignals, decide, evaluate_transition};
pub use engine::{PromotionEngine, PromotionOutcome};
