//! Embedding gateway trait and vector utilities.
//!
//! Defines the [`EmbeddingGateway`] contract every embedding backend
//! implements, plus pure helpers for similarity computation and vector
//! serialization.
//!
//! Concrete gateways (OpenAI, Ollama) live in the `credence` app crate.
//! [`StaticGateway`] is a deterministic in-process gateway for tests and
//! offline runs.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Converts text into fixed-dimension float vectors.
///
/// Failures are classified, never retried here: transport errors,
/// timeouts, rate limits and 5xx responses surface as
/// [`Error::Transient`] so that the caller owns the retry policy.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-ada-002"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Largest number of texts accepted by one [`embed_batch`](Self::embed_batch) call.
    fn max_batch(&self) -> usize;

    /// Embed a single text at low latency (used for queries).
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts; output positions match input positions.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a free-text query and return it L2-normalized.
///
/// Rejects vectors whose dimension differs from the gateway's declared
/// dimension.
pub async fn embed_query<G: EmbeddingGateway + ?Sized>(gateway: &G, text: &str) -> Result<Vec<f32>> {
    let vector = gateway.embed_one(text).await?;
    check_dims(&vector, gateway.dims())?;
    Ok(normalize(&vector))
}

/// Check that `vector` has exactly `dims` finite components.
pub fn check_dims(vector: &[f32], dims: usize) -> Result<()> {
    if vector.len() != dims {
        return Err(Error::InvariantViolation(format!(
            "vector dimension {} does not match configured dimension {}",
            vector.len(),
            dims
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvariantViolation(
            "vector contains non-finite components".into(),
        ));
    }
    Ok(())
}

/// Euclidean norm, accumulated in double precision.
pub fn norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let n = norm(vector);
    if n == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|&x| (f64::from(x) / n) as f32).collect()
}

/// Compute cosine similarity (`1 - cosine distance`) between two vectors.
///
/// Computed in double precision regardless of storage precision, so that
/// equivalent vectors land on the same side of a threshold. The result is
/// clamped to `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, and
/// zero-magnitude vectors; never `NaN`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    cosine_with_norms(a, norm(a), b, norm(b))
}

/// [`cosine_similarity`] with precomputed norms.
pub fn cosine_with_norms(a: &[f32], norm_a: f64, b: &[f32], norm_b: f64) -> f64 {
    if a.len() != b.len() || norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum();
    let sim = dot / (norm_a * norm_b);
    if sim.is_nan() {
        return 0.0;
    }
    sim.clamp(-1.0, 1.0)
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use credence_core::embedding::{vec_to_blob, blob_to_vec};
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

/// Deterministic gateway backed by a lookup table.
///
/// Texts registered with [`with_vector`](Self::with_vector) map to their
/// fixed vector; any other text maps to a pseudo-random vector derived
/// from the SHA-256 of the text. Identical texts always embed identically.
pub struct StaticGateway {
    dims: usize,
    max_batch: usize,
    table: HashMap<String, Vec<f32>>,
}

impl StaticGateway {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            max_batch: 16,
            table: HashMap::new(),
        }
    }

    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.table.insert(text.into(), vector);
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    fn lookup(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.table.get(text) {
            return v.clone();
        }
        let mut out = Vec::with_capacity(self.dims);
        let mut counter = 0u32;
        while out.len() < self.dims {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            for pair in hasher.finalize().chunks_exact(2) {
                if out.len() == self.dims {
                    break;
                }
                let raw = u16::from_le_bytes([pair[0], pair[1]]);
                out.push(f32::from(raw) / f32::from(u16::MAX) - 0.5);
            }
            counter += 1;
        }
        out
    }
}

#[async_trait]
impl EmbeddingGateway for StaticGateway {
    fn model_name(&self) -> &str {
        "static"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.lookup(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.len() > self.max_batch {
            return Err(Error::InvalidArgument(format!(
                "batch of {} exceeds limit {}",
                texts.len(),
                self.max_batch
            )));
        }
        Ok(texts.iter().map(|t| self.lookup(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_scale_invariant() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![10.0, 20.0, 30.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-12);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!((sim + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        let zero = vec![0.0, 0.0, 0.0];
        let v = vec![1.0, 2.0, 3.0];
        assert_eq!(cosine_similarity(&zero, &v), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_cosine_empty_and_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_normalize_unit_length() {
        let n = normalize(&[3.0, 4.0]);
        assert!((norm(&n) - 1.0).abs() < 1e-6);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_check_dims() {
        assert!(check_dims(&[1.0, 2.0], 2).is_ok());
        assert!(matches!(
            check_dims(&[1.0], 2),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            check_dims(&[f32::NAN, 1.0], 2),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_static_gateway_deterministic() {
        let gw = StaticGateway::new(8).with_vector("pinned", vec![1.0; 8]);
        let a = gw.embed_one("hello").await.unwrap();
        let b = gw.embed_batch(&["hello".to_string()]).await.unwrap();
        assert_eq!(a.len(), 8);
        assert_eq!(vec![a], b);
        assert_eq!(gw.embed_one("pinned").await.unwrap(), vec![1.0; 8]);
    }

    #[tokio::test]
    async fn test_embed_query_normalizes() {
        let gw = StaticGateway::new(2).with_vector("q", vec![3.0, 4.0]);
        let v = embed_query(&gw, "q").await.unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_static_gateway_enforces_batch_limit() {
        let gw = StaticGateway::new(4).with_max_batch(2);
        let texts: Vec<String> = (0..3).map(|i| i.to_string()).collect();
        assert!(gw.embed_batch(&texts).await.is_err());
    }
}
