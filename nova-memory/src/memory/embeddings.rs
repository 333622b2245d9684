//! Embedding Generation
//!
//! Turns text into fixed-dimension vectors for similarity search. Two
//! backends sit behind the [`Embedder`] trait:
//!
//! - [`EmbeddingService`]: local all-MiniLM-L6-v2 inference via `fastembed`
//!   (384 dimensions, lazily loaded, `embeddings` feature)
//! - [`HashedEmbedder`]: deterministic feature hashing, no model download
//!
//! [`EmbeddingGenerator`] wraps either one with a timeout. Any failure comes
//! back as `EmbeddingUnavailable`, which the write path absorbs by storing the
//! record without a vector.
//!
//! # Usage
//!
//! ```ignore
//! use nova_memory::memory::embeddings::{EmbeddingGenerator, HashedEmbedder};
//!
//! let generator = EmbeddingGenerator::new(Arc::new(HashedEmbedder::new(384)), Duration::from_secs(5));
//! let vector = generator.generate("hello world").await?;
//! let similarity = cosine_similarity(&vector, &other_vector);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::{MemoryError, MemoryResult};

/// Embedding dimensions for all-MiniLM-L6-v2
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Text embedding backend
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text; identical input yields an identical vector
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>>;

    /// Vector dimensions produced by this backend
    fn dimensions(&self) -> usize;

    /// Model identifier, recorded for diagnostics
    fn model_name(&self) -> &str;
}

/// Build the configured backend
pub fn embedder_from_config(config: &EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.backend {
        EmbeddingBackend::Fastembed => Arc::new(EmbeddingService::new()),
        EmbeddingBackend::Hashed => Arc::new(HashedEmbedder::new(config.dimensions)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// fastembed backend
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding service backed by a local fastembed model
#[cfg(feature = "embeddings")]
pub struct EmbeddingService {
    model: Arc<tokio::sync::RwLock<Option<Arc<fastembed::TextEmbedding>>>>,
}

#[cfg(not(feature = "embeddings"))]
pub struct EmbeddingService {
    _phantom: std::marker::PhantomData<()>,
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "embeddings")]
impl EmbeddingService {
    /// Create a new embedding service
    pub fn new() -> Self {
        Self {
            model: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Load the model on first use and hand out a shared handle
    async fn ensure_model(&self) -> MemoryResult<Arc<fastembed::TextEmbedding>> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        if let Some(model) = self.model.read().await.as_ref() {
            return Ok(Arc::clone(model));
        }

        let mut model_guard = self.model.write().await;
        if let Some(model) = model_guard.as_ref() {
            return Ok(Arc::clone(model));
        }

        tracing::info!("Loading embedding model: all-MiniLM-L6-v2");
        let start = std::time::Instant::now();

        let model = tokio::task::spawn_blocking(|| {
            let mut init_options = InitOptions::default();
            init_options.model_name = EmbeddingModel::AllMiniLML6V2;
            init_options.show_download_progress = false;
            TextEmbedding::try_new(init_options)
        })
        .await
        .map_err(|e| MemoryError::embedding_unavailable(format!("model loader panicked: {}", e)))?
        .map_err(|e| MemoryError::embedding_unavailable(format!("failed to load embedding model: {}", e)))?;

        tracing::info!("Embedding model loaded in {:?}", start.elapsed());

        let model = Arc::new(model);
        *model_guard = Some(Arc::clone(&model));
        Ok(model)
    }

    /// Check if the model is loaded
    pub async fn is_loaded(&self) -> bool {
        self.model.read().await.is_some()
    }
}

#[cfg(feature = "embeddings")]
#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let model = self.ensure_model().await?;
        let text = text.to_string();

        // Inference is CPU-bound; keep it off the async workers
        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|e| MemoryError::embedding_unavailable(format!("inference panicked: {}", e)))?
            .map_err(|e| MemoryError::embedding_unavailable(format!("failed to generate embedding: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::embedding_unavailable("no embedding generated"))
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    fn model_name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }
}

#[cfg(not(feature = "embeddings"))]
impl EmbeddingService {
    /// Create a new embedding service (no-op without embeddings feature)
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }

    /// Check if the model is loaded
    pub async fn is_loaded(&self) -> bool {
        false
    }
}

#[cfg(not(feature = "embeddings"))]
#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, _text: &str) -> MemoryResult<Vec<f32>> {
        Err(MemoryError::embedding_unavailable(
            "embeddings feature not enabled; compile with --features embeddings",
        ))
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    fn model_name(&self) -> &str {
        "all-MiniLM-L6-v2"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hashed backend
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic bag-of-words embedder.
///
/// Each lowercase token is hashed into a signed bucket; the result is L2
/// normalised so cosine similarity reflects token overlap.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimensions: usize,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
            ]) as usize
                % self.dimensions;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(MemoryError::embedding_unavailable("empty text"));
        }
        Ok(self.vectorize(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "feature-hash-v1"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Generator
// ─────────────────────────────────────────────────────────────────────────────

/// Embedding generator with a bounded wait
#[derive(Clone)]
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self { embedder, timeout }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(
            embedder_from_config(config),
            Duration::from_millis(config.timeout_ms),
        )
    }

    /// Generate an embedding or fail with `EmbeddingUnavailable`
    pub async fn generate(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let vector = match tokio::time::timeout(self.timeout, self.embedder.embed(text)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(MemoryError::EmbeddingUnavailable { reason })) => {
                return Err(MemoryError::EmbeddingUnavailable { reason });
            }
            Ok(Err(e)) => return Err(MemoryError::embedding_unavailable(e.to_string())),
            Err(_) => {
                return Err(MemoryError::embedding_unavailable(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        if vector.len() != self.embedder.dimensions() {
            return Err(MemoryError::embedding_unavailable(format!(
                "expected {} dimensions, got {}",
                self.embedder.dimensions(),
                vector.len()
            )));
        }

        Ok(vector)
    }

    /// Generate an embedding, logging and absorbing failures
    pub async fn generate_or_none(&self, text: &str) -> Option<Vec<f32>> {
        match self.generate(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(model = self.embedder.model_name(), "storing without embedding: {}", e);
                None
            }
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }
}

/// Compute cosine similarity between two vectors
///
/// Returns a value between -1.0 and 1.0, where 1.0 means identical,
/// 0.0 means orthogonal, and -1.0 means opposite.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
