//! Tiered Memory System
//!
//! Implements a three-tier memory architecture:
//! - Short-term (STM): per-session working context, fixed TTL, FIFO capacity
//! - Intermediate-term (ITM): recurring context, sliding TTL, least-accessed eviction
//! - Long-term (LTM): validated, durable knowledge in SQLite
//!
//! # Architecture
//!
//! STM and ITM live in the [`TieredCache`], which writes through to its own
//! table so the tiers survive a restart. Records only reach [`LongTermStore`]
//! through promotion (or an explicit LTM write), and a promoted record keeps
//! its id so the move happens at most once.

mod cache;
mod cache_store;
mod store;
mod types;
pub mod embeddings;
pub mod quota;

pub mod migrations;

// Re-export public types
pub use types::{
    MatchKind, MemoryKind, MemoryPatch, MemoryRecord, MemoryStats, MemoryTier, Outcome,
    ScoredMemory, SearchQuery, StoreMemoryInput, rank_scored,
};

pub use cache::TieredCache;
pub(crate) use store::score_candidate;
pub use store::LongTermStore;
pub use embeddings::{Embedder, EmbeddingGenerator, HashedEmbedder, cosine_similarity};
pub use quota::{PlanQuotaAuthority, QuotaAuthority, QuotaLimits};
