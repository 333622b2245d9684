//! Nova Memory - Tiered Memory with Constitutional Promotion
//!
//! This crate provides the memory core of a conversational agent. All
//! functionality is reachable through [`MemoryEngine`], including:
//!
//! # Modules
//!
//! - **memory** - STM/ITM cache, SQLite-backed LTM store, embeddings, quota
//! - **policy** - rule-based validator, signed policy records, hash-chained audit log
//! - **promotion** - pure tier-transition decisions and at-most-once LTM writes
//! - **distillation** - reflection task and the periodic distillation job
//!
//! # Task contracts
//!
//! The engine never spawns background work. An external scheduler calls
//! [`MemoryEngine::reflection_task`] after each interaction and
//! [`MemoryEngine::distillation_run`] on a cadence; both are idempotent.
//!
//! # Example
//!
//! ```rust,no_run
//! use nova_memory::{EngineConfig, MemoryEngine, MemoryKind, MemoryTier, SearchQuery, StoreMemoryInput};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let engine = MemoryEngine::open(EngineConfig::new("nova.db")).await?;
//!
//!     // Store short-term memory
//!     let record = engine
//!         .store(StoreMemoryInput::new("user-123", "User ran `git status`", MemoryKind::Task).with_session("s1"))
//!         .await?;
//!
//!     // Retrieve relevant context
//!     let hits = engine.search(&SearchQuery::new("user-123", "git")).await?;
//!
//!     // Ask for promotion once the record has proven itself
//!     let outcome = engine.promote("user-123", &record.id, MemoryTier::Itm).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod distillation;
pub mod memory;
pub mod policy;
pub mod promotion;
pub mod utils;

mod config;
mod engine;
mod error;

// Re-export main engine types
pub use config::{
    CacheConfig, ConfigValidationError, DistillationConfig, EmbeddingBackend, EmbeddingConfig, EngineConfig,
    PolicyConfig, PromotionConfig, QuotaConfig, StorageConfig,
};
pub use engine::MemoryEngine;
pub use error::{MemoryError, MemoryResult};

pub use distillation::{DistillationReport, DistillationStatus, DistilledKnowledge, ReflectionRecord};
pub use memory::{
    MatchKind, MemoryKind, MemoryPatch, MemoryRecord, MemoryStats, MemoryTier, Outcome, ScoredMemory, SearchQuery,
    StoreMemoryInput,
};
pub use policy::{AlignmentResult, ChainVerification, ConstitutionalValidator, ValidationContext, ValidationResult};
pub use promotion::PromotionOutcome;
