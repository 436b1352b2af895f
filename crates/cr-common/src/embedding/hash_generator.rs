use std::hash::{Hash, Hasher};

use siphasher::sip::SipHasher13;

use super::{EmbedError, EmbeddingGenerator};

/// Fixed seeds keep the hash deterministic across processes and Rust
/// versions. Changing either changes every stored vector, so bump the
/// model id alongside.
const HASH_SEED_K0: u64 = 0x6d0e_5a17_43c2_91fb;
const HASH_SEED_K1: u64 = 0x1f8b_27ae_d904_5c63;

/// Deterministic feature-hashing embedder.
///
/// - no training, no network: tokens are sign-hashed into a
///   fixed-dimension vector and L2-normalized
/// - serves as the default backend and as the stand-in for the opaque
///   external embedding service in tests
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn hash_token(&self, token: &str) -> usize {
        let mut hasher = SipHasher13::new_with_keys(HASH_SEED_K0, HASH_SEED_K1);
        token.hash(&mut hasher);
        (hasher.finish() as usize) % self.dimension
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let idx = self.hash_token(&token);
            // Sign hashing keeps the expected dot product of unrelated
            // token sets near zero.
            let sign = if self.hash_token(&format!("{token}_sign")) % 2 == 0 {
                1.0
            } else {
                -1.0
            };
            vector[idx] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        vector
    }
}

impl EmbeddingGenerator for HashEmbedder {
    fn model_id(&self) -> &str {
        "hash-v1"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts
            .iter()
            .map(|text| {
                if text.trim().is_empty() {
                    Err(EmbedError::InvalidInput(
                        "cannot embed empty profile text".into(),
                    ))
                } else {
                    Ok(self.embed_text(text))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn vectors_are_l2_normalized() {
        let embedder = HashEmbedder::new(128);
        let vector = embedder.embed_one("rust kubernetes postgres").unwrap();

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "L2 norm should be 1.0, got {norm}");
    }

    #[test]
    fn embedding_is_deterministic() {
        let embedder = HashEmbedder::new(128);
        let a = embedder.embed_one("senior rust engineer").unwrap();
        let b = embedder.embed_one("senior rust engineer").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn similar_texts_score_higher_than_unrelated_texts() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed_one("rust backend postgres").unwrap();
        let close = embedder.embed_one("rust postgres services").unwrap();
        let far = embedder.embed_one("oil painting restoration").unwrap();

        assert!(cosine_similarity(&query, &close) > cosine_similarity(&query, &far));
    }

    #[test]
    fn empty_input_is_rejected_per_batch_entry() {
        let embedder = HashEmbedder::new(64);
        let err = embedder
            .embed_batch(&["   ".to_string()])
            .expect_err("blank input must fail");
        assert!(matches!(err, EmbedError::InvalidInput(_)));
    }

    #[test]
    fn batch_returns_one_vector_per_input() {
        let embedder = HashEmbedder::new(64);
        let vectors = embedder
            .embed_batch(&["one".into(), "two".into(), "three".into()])
            .unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 64));
    }
}
