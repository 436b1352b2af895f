pub mod hash_generator;
pub mod similarity;

pub use hash_generator::HashEmbedder;
pub use similarity::cosine_similarity;

use thiserror::Error;

/// Errors an embedding backend can surface. The split drives the queue
/// retry policy: `Timeout`/`RateLimited` are retryable, `InvalidInput`
/// fails the job immediately.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding backend timed out: {0}")]
    Timeout(String),
    #[error("embedding backend rate limited: {0}")]
    RateLimited(String),
    #[error("invalid embedding input: {0}")]
    InvalidInput(String),
    #[error("embedding backend failure: {0}")]
    Backend(String),
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbedError::Timeout(_) | EmbedError::RateLimited(_))
    }
}

/// Abstraction over the external embedding capability: text in, one
/// fixed-length vector per input out.
///
/// The dimension is a deployment constant; `model_id()` is recorded
/// into embedding metadata so stored vectors carry provenance.
pub trait EmbeddingGenerator: Send + Sync {
    /// Identifier recorded as `embedding_model` ("hash-v1", an API
    /// model name, ...).
    fn model_id(&self) -> &str;

    /// Fixed output dimension.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts. Empty or whitespace-only inputs must be
    /// rejected with `EmbedError::InvalidInput`.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string()))?;
        vectors
            .pop()
            .ok_or_else(|| EmbedError::Backend("backend returned no vector".into()))
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub dimension: usize,
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 256,
            model: "hash".into(),
        }
    }
}

/// Read the embedding setup from `CR_EMBED_*` variables.
pub fn load_config_from_env() -> EmbeddingConfig {
    EmbeddingConfig {
        dimension: std::env::var("CR_EMBED_DIMENSION")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256),
        model: std::env::var("CR_EMBED_MODEL").unwrap_or_else(|_| "hash".into()),
    }
}

/// Build a generator by name. Unknown names fall back to the
/// deterministic hash embedder so the pipeline never starts without a
/// working backend.
pub fn create_generator(config: &EmbeddingConfig) -> Box<dyn EmbeddingGenerator> {
    match config.model.as_str() {
        "hash" => Box::new(HashEmbedder::new(config.dimension)),
        other => {
            tracing::warn!(model = other, "unknown embedding model; using hash embedder");
            Box::new(HashEmbedder::new(config.dimension))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_follows_taxonomy() {
        assert!(EmbedError::Timeout("t".into()).is_retryable());
        assert!(EmbedError::RateLimited("r".into()).is_retryable());
        assert!(!EmbedError::InvalidInput("empty".into()).is_retryable());
        assert!(!EmbedError::Backend("boom".into()).is_retryable());
    }

    #[test]
    fn factory_falls_back_to_hash_for_unknown_models() {
        let generator = create_generator(&EmbeddingConfig {
            dimension: 64,
            model: "does-not-exist".into(),
        });
        assert_eq!(generator.dimension(), 64);
        assert_eq!(generator.model_id(), "hash-v1");
    }
}
