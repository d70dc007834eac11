//! Embedding provider (C1): maps text to a fixed-dimension float vector.
//!
//! An embedding failure is modeled as `Ok(None)` rather than substituted with
//! a zero vector, so every reader (reuse gate, learner, lesson retrieval)
//! treats "no embedding" as a first-class value to skip rather than a value
//! to compare against.

use std::fmt;

/// Fixed embedding dimension for this deployment. Every persisted vector
/// MUST have exactly this length (see `RunnerError::InvariantViolation`).
pub const EMBEDDING_DIM: usize = 1024;

/// Abstract embedding capability. Implementations MUST NOT panic; failures
/// are returned as `Ok(None)`, matching the "embedding failure as a
/// first-class value" design note.
pub trait Embedder: Send + Sync {
    /// Embeds `text`, returning `None` on any recoverable failure (model
    /// unavailable, request error, etc.).
    fn embed(&self, text: &str) -> Option<Vec<f32>>;

    /// The fixed dimension this embedder produces.
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

impl fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Embedder(dim={})", self.dimension())
    }
}

/// Computes cosine similarity between two equal-length vectors.
///
/// Returns `0.0` for mismatched lengths or zero-magnitude vectors rather than
/// panicking or dividing by zero — callers treat this as "not similar" rather
/// than as an error, since a degenerate vector should never win a top-K query.
#[must_use]
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

/// Deterministic, dependency-free embedder used when `fastembed-embeddings`
/// is disabled or the model fails to load. Hashes overlapping word shingles
/// into a fixed-width vector so that semantically identical text always
/// produces an identical vector and near-duplicate text produces a similar
/// one; it is not a substitute for a real semantic model, only a fallback
/// that keeps the reuse gate and lesson retrieval mechanically exercisable.
#[derive(Debug, Default)]
pub struct DeterministicEmbedder;

impl Embedder for DeterministicEmbedder {
    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        for token in text.split_whitespace() {
            let mut hasher_state: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                hasher_state ^= u64::from(byte);
                hasher_state = hasher_state.wrapping_mul(0x0000_0100_0000_01B3);
            }
            let slot = (hasher_state as usize) % EMBEDDING_DIM;
            vector[slot] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Some(vector)
    }
}

/// `fastembed`-backed embedder using a local ONNX BGE-M3 model (1024 dims),
/// matching the teacher's `fastembed-embeddings` default feature.
#[cfg(feature = "fastembed-embeddings")]
pub struct FastEmbedEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "fastembed-embeddings")]
impl FastEmbedEmbedder {
    /// Initializes the local embedding model. Returns an error if the model
    /// cannot be loaded (missing weights, download failure, etc.); callers
    /// should fall back to [`DeterministicEmbedder`] in that case.
    pub fn try_new() -> Result<Self, fastembed::Error> {
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed::EmbeddingModel::BGEM3),
        )?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
        })
    }
}

#[cfg(feature = "fastembed-embeddings")]
impl Embedder for FastEmbedEmbedder {
    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let mut model = self.model.lock().ok()?;
        let embeddings = model.embed(vec![text], None).ok()?;
        embeddings.into_iter().next()
    }
}

/// Creates the default embedder for this deployment: `fastembed` when the
/// feature is enabled and the model loads successfully, otherwise the
/// deterministic fallback.
#[must_use]
pub fn create_default_embedder() -> Box<dyn Embedder> {
    #[cfg(feature = "fastembed-embeddings")]
    {
        if let Ok(embedder) = FastEmbedEmbedder::try_new() {
            return Box::new(embedder);
        }
    }
    Box::new(DeterministicEmbedder)
}
