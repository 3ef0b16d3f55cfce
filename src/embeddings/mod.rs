//! Embedding provider abstraction.
//!
//! Providers turn text into fixed-length float vectors. The dimensionality
//! is fixed per deployment; vectors from models with a different native
//! size are adapted (cycle-padded or truncated) and re-normalized so cosine
//! similarity stays meaningful.

pub mod http;

use async_trait::async_trait;

use crate::errors::Result;

pub use http::HttpEmbeddingProvider;

/// Contract for embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Fixed output dimensionality for this deployment.
    fn dimension(&self) -> usize;

    /// Embed a single text into a unit-length vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts. The default implementation loops over
    /// [`EmbeddingProvider::embed`]; backends with a batch endpoint
    /// should override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Normalize a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Adapt a vector to `target` dimensions.
///
/// Shorter vectors are cycle-padded (repeating the source preserves more
/// relative structure than zero fill), longer ones truncated; both results
/// are re-normalized.
pub fn adapt_dimension(v: Vec<f32>, target: usize) -> Vec<f32> {
    if v.len() == target {
        return v;
    }
    if v.is_empty() {
        return vec![0.0; target];
    }
    let adapted: Vec<f32> = if v.len() < target {
        (0..target).map(|i| v[i % v.len()]).collect()
    } else {
        v[..target].to_vec()
    };
    normalize(adapted)
}

/// Cosine similarity between two vectors (0 when either is zero-length).
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_adapt_pads_by_cycling() {
        let v = adapt_dimension(vec![1.0, 2.0], 5);
        assert_eq!(v.len(), 5);
        // Cycled pattern before normalization: 1 2 1 2 1.
        assert!(v[0] > 0.0 && (v[0] - v[2]).abs() < 1e-6 && (v[1] - v[3]).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_adapt_truncates() {
        let v = adapt_dimension(vec![1.0, 0.0, 0.0, 5.0], 2);
        assert_eq!(v.len(), 2);
        assert!((v[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_parallel() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
