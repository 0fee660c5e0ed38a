//! Embedding contract.
//!
//! The embedding model is an external collaborator; the engine only needs
//! `embed(text) -> vector` with a fixed dimensionality. [`HashEmbedder`] is
//! the built-in fallback so ingest and search remain operable without a
//! configured embedding service.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Opaque text-embedding service.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts. The default implementation embeds
    /// sequentially; services with batch endpoints override this.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimensionality. Must match the configured dimension.
    fn dim(&self) -> usize;
}

/// Verify an embedder agrees with the configured dimension. Fatal at
/// startup when it does not.
pub fn validate_dim(embedder: &dyn Embedder, configured: usize) -> Result<()> {
    if embedder.dim() != configured {
        return Err(Error::config(format!(
            "embedder produces {}-dimensional vectors but {} is configured",
            embedder.dim(),
            configured
        )));
    }
    Ok(())
}

/// Deterministic feature-hashing embedder.
///
/// Tokenizes on non-alphanumeric boundaries, hashes each token into a
/// bucket, and L2-normalizes the result. Not a semantic model; it provides
/// stable, language-agnostic vectors for deployments without an external
/// embedding service and for exercising the vector path end to end.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let digest = Sha256::digest(token.as_bytes());
        let index = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) as usize
            % self.dim;
        // Second hash byte decides the sign to spread collisions.
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(768)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let (index, sign) = self.bucket(&token.to_lowercase());
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Fixed-vector embedder for tests.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dim: usize,
    fail: bool,
}

#[cfg(any(test, feature = "testing"))]
impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, fail: false }
    }

    /// An embedder whose every call fails, for exercising the
    /// degrade-to-null paths.
    pub fn failing(dim: usize) -> Self {
        Self { dim, fail: true }
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail {
            return Err(Error::embedding("mock embedder configured to fail"));
        }
        let mut vector = vec![0.0f32; self.dim];
        if self.dim > 0 {
            vector[text.len() % self.dim] = 1.0;
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("fn main() {}").await.unwrap();
        let b = embedder.embed("fn main() {}").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn hash_embedder_output_is_normalized() {
        let embedder = HashEmbedder::new(128);
        let v = embedder.embed("let x = parse(input)?;").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn similar_texts_are_closer_than_dissimilar() {
        let embedder = HashEmbedder::new(256);
        let a = embedder.embed("async fn fetch_user(id: u64)").await.unwrap();
        let b = embedder.embed("async fn fetch_user(name: &str)").await.unwrap();
        let c = embedder.embed("SELECT embedding FROM repo_docs").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn dim_validation_rejects_mismatch() {
        let embedder = HashEmbedder::new(384);
        assert!(validate_dim(&embedder, 768).is_err());
        assert!(validate_dim(&embedder, 384).is_ok());
    }

    #[test]
    fn cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        let v = [0.6f32, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }
}
