// Embeddings module
// This module handles the embedding provider seam and its Ollama implementation

pub mod ollama;

use async_trait::async_trait;

use crate::index::IndexError;

pub use ollama::{DEFAULT_EMBEDDING_DIMENSION, EmbeddingResult, OllamaClient};

/// Maps text to a fixed-dimension vector.
///
/// Implementations must be safe to call concurrently and keep the same output
/// dimension for the lifetime of the process. Failures are reported as
/// [`IndexError::EmbeddingProvider`] or [`IndexError::Timeout`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError>;

    /// Embed many texts, preserving input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// Whether the provider is reachable and its model is available
    async fn health_check(&self) -> bool {
        true
    }

    /// Human-readable model identifier for logs and status output
    fn model_name(&self) -> &str;
}
