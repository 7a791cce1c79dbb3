//! Embedding model boundary.
//!
//! Embedding is an external collaborator: text in, fixed-length vector out.
//! The pipeline only depends on [`EmbeddingProvider`]; production wiring
//! supplies a provider backed by a hosted model, while tests and local runs
//! use the deterministic [`MockEmbeddingProvider`].

use async_trait::async_trait;

use crate::types::CorpusError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CorpusError>;

    /// Embeds a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CorpusError> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| CorpusError::Embedding("provider returned no vector".to_string()))
    }

    /// Length of every vector this provider produces.
    fn dimensions(&self) -> usize;

    /// Model identifier recorded on ingested documents as the embedding
    /// version.
    fn model_id(&self) -> &str;
}

/// Deterministic, dependency-free provider for tests and local development.
///
/// Vectors are derived from a hash of the input text, so identical texts map
/// to identical vectors and distinct texts almost always differ.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dimensions: usize,
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self { dimensions: 8 }
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions.max(1);
        self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        let mut vector: Vec<f32> = (0..self.dimensions)
            .map(|i| {
                let bits = seed.rotate_left((i as u32 % 63) + 1) ^ ((i as u64) << 17);
                (bits % 10_000) as f32 / 10_000.0 - 0.5
            })
            .collect();

        // Normalize so cosine comparisons behave like a real model's output.
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CorpusError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        "mock-embedding"
    }
}
