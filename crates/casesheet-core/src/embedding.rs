//! Embedding capability trait and vector utilities.
//!
//! Every vector in the index has exactly [`EMBEDDING_DIMS`] components.
//! The constant is process-wide; changing it is a breaking schema change
//! that requires re-embedding every stored chunk.
//!
//! Concrete network providers (OpenAI, Ollama, fastembed) live in the
//! `casesheet` app crate. [`HashedEmbedder`] is a deterministic offline
//! provider used by default and in tests.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::PipelineError;

/// Dimension of every embedding vector stored or searched.
pub const EMBEDDING_DIMS: usize = 1024;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"bge-m3"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text and check its dimension.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let vector = embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::TransientProvider("empty embedding response".into()))?;
    check_dims(&vector)?;
    Ok(vector)
}

/// Reject any vector whose length differs from [`EMBEDDING_DIMS`].
pub fn check_dims(vector: &[f32]) -> Result<(), PipelineError> {
    if vector.len() != EMBEDDING_DIMS {
        return Err(PipelineError::DimensionMismatch {
            expected: EMBEDDING_DIMS,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use casesheet_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

// ============ Hashed Embedder ============

/// Deterministic bag-of-words embedder using feature hashing.
///
/// Lowercased word tokens and their character trigrams are hashed into
/// [`EMBEDDING_DIMS`] buckets and the result is L2-normalized. No model,
/// no network: suitable for offline runs and tests, not for quality.
pub struct HashedEmbedder;

impl HashedEmbedder {
    fn embed_text(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIMS];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            v[bucket(token)] += 1.0;
            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for tri in chars.windows(3) {
                    let gram: String = tri.iter().collect();
                    v[bucket(&gram)] += 0.5;
                }
            }
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

/// FNV-1a bucket for a token.
fn bucket(token: &str) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in token.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % EMBEDDING_DIMS as u64) as usize
}

#[async_trait]
impl Embedder for HashedEmbedder {
    fn model_name(&self) -> &str {
        "hashed"
    }

    fn dims(&self) -> usize {
        EMBEDDING_DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_check_dims() {
        assert!(check_dims(&vec![0.0; EMBEDDING_DIMS]).is_ok());
        assert!(matches!(
            check_dims(&[0.0; 3]),
            Err(PipelineError::DimensionMismatch { actual: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_hashed_embedder_shape_and_similarity() {
        let texts = vec![
            "salario diario cuota diaria".to_string(),
            "Salario Diario: $ 250.00".to_string(),
            "fecha de despido".to_string(),
        ];
        let vecs = HashedEmbedder.embed(&texts).await.unwrap();
        assert!(vecs.iter().all(|v| v.len() == EMBEDDING_DIMS));
        let near = cosine_similarity(&vecs[0], &vecs[1]);
        let far = cosine_similarity(&vecs[0], &vecs[2]);
        assert!(near > far);
    }

    #[tokio::test]
    async fn test_hashed_embedder_deterministic() {
        let a = embed_one(&HashedEmbedder, "contrato individual").await.unwrap();
        let b = embed_one(&HashedEmbedder, "contrato individual").await.unwrap();
        assert_eq!(a, b);
    }
}
