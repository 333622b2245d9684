//! Constitutional Policy
//!
//! - **rules** - the eight-category pattern rule set
//! - **validator** - content and alignment scoring behind [`ConstitutionalValidator`]
//! - **record** - signed, versioned policy records
//! - **audit** - hash-chained audit log, one chain per lineage
//!
//! The validator depends on nothing from promotion; promotion only sees the
//! [`ConstitutionalValidator`] trait.

mod audit;
mod record;
mod rules;
mod validator;

pub mod migrations;

pub use audit::{AuditEntry, AuditLog, BrokenLink, ChainVerification, GENESIS_HASH};
pub use record::{PolicyRecord, PolicyRegistry, Principle, default_principles};
pub use rules::{CategoryMatch, PRINCIPLES, RULESET_VERSION, RuleCategory, RuleEvaluation, RuleSet};
pub use validator::{
    AlignmentResult, ConstitutionalValidator, PolicyValidator, ValidationContext, ValidationResult,
};
