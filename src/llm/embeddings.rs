//! Embedding provider seam and the vector helpers used by hybrid recall.
//!
//! Embeddings are stored as little-endian f32 blobs. When the provider is
//! unavailable the recall blend drops its vector component and renormalizes.

use async_trait::async_trait;

use crate::errors::{Result, TxError};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn is_available(&self) -> bool;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Fallback provider: always unavailable.
pub struct NoopEmbedding;

#[async_trait]
impl EmbeddingProvider for NoopEmbedding {
    fn is_available(&self) -> bool {
        false
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(TxError::EmbeddingUnavailable {
            reason: "no embedding backend configured".to_string(),
        })
    }
}

/// Serialize a vector to its on-disk blob form (little-endian f32s).
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode an embedding blob. Returns `None` when the blob length is not a
/// multiple of 4 (corrupt row).
pub fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Cosine similarity in [-1, 1]; 0 for mismatched or zero-norm vectors.
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
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
