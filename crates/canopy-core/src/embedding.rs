//! Vectorizer trait and vector utilities.
//!
//! Defines the [`Vectorizer`] trait every embedding backend implements,
//! an offline [`HashVectorizer`], and pure helpers for vector
//! serialization and similarity.
//!
//! HTTP-backed vectorizers (OpenAI, Ollama) live in the `canopy` app crate.

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Text → fixed-length vector.
///
/// Implementations must return exactly one vector per input text, in
/// input order, each of length [`dims`](Vectorizer::dims).
#[async_trait]
pub trait Vectorizer: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Vectorize a batch of texts.
    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Vectorize a single text.
pub async fn vectorize_one(vectorizer: &dyn Vectorizer, text: &str) -> Result<Vec<f32>> {
    let mut out = vectorizer.vectorize(&[text.to_string()]).await?;
    match out.pop() {
        Some(v) if out.is_empty() => Ok(v),
        _ => bail!(
            "{} returned a malformed batch for a single text",
            vectorizer.model_name()
        ),
    }
}

/// Check that a batch result has one vector of the right width per input.
pub fn check_batch(vectorizer: &dyn Vectorizer, inputs: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != inputs {
        bail!(
            "{} returned {} vectors for {} inputs",
            vectorizer.model_name(),
            vectors.len(),
            inputs
        );
    }
    let dims = vectorizer.dims();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        bail!(
            "{} returned a {}-dim vector, expected {}",
            vectorizer.model_name(),
            bad.len(),
            dims
        );
    }
    Ok(())
}

/// Deterministic offline vectorizer based on feature hashing.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims` buckets with a sign bit; the result is L2-normalised. Texts
/// sharing vocabulary end up close under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashVectorizer {
    dims: usize,
}

impl HashVectorizer {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl Default for HashVectorizer {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Vectorizer for HashVectorizer {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn vectorize(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

/// Scale `v` to unit length in place (no-op for the zero vector).
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use canopy_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
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

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
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
