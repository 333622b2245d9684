//! Reflection and Distillation
//!
//! The two task contracts an external scheduler drives:
//! - [`ReflectionTask`] - one alignment-checked self-assessment per memory
//! - [`DistillationJob`] - periodic aggregation of reflections into durable
//!   LTM knowledge, with contradiction handling and checkpointed re-runs
//!
//! Neither spawns background work; both are idempotent entry points.

mod job;
mod knowledge;
mod reflection;

pub mod migrations;

pub use job::{
    DISTILLED_TAG, DistillationJob, DistillationReport, DistillationStatus, GLOBAL_SCOPE, aggregate_score,
    recency_weight,
};
pub use knowledge::{Checkpoint, DistilledKnowledge, KnowledgeStore};
pub use reflection::{
    DEFAULT_TOPIC, ReflectionRecord, ReflectionStore, ReflectionTask, build_self_assessment, topic_key,
};
