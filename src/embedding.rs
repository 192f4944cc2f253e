//! Text to vector encoding.
//!
//! [`EmbeddingProvider`] is the seam to whatever model turns commands into
//! vectors. [`HashingEmbedder`] is a dependency-free provider: signed feature
//! hashing over tokens and character trigrams, L2-normalized.
//!
//! All similarity scores handed to the rest of the system go through
//! [`similarity`], which rescales cosine from [-1, 1] into [0, 1] so that
//! semantic confidences are comparable with the other tiers.

use std::path::Path;

/// Number of trailing history entries blended into a context vector.
pub const HISTORY_CONTEXT: usize = 5;

const PARTIAL_WEIGHT: f32 = 0.6;
const DIRECTORY_WEIGHT: f32 = 0.2;
const HISTORY_WEIGHT: f32 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Cannot embed empty text")]
    EmptyInput,

    #[error("Embedding generation failed: {0}")]
    EncodeFailed(String),

    #[error("Retraining failed: {0}")]
    RetrainFailed(String),
}

pub trait EmbeddingProvider: Send + Sync {
    fn dimensions(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Blend the partial command with the working directory's name and the
    /// mean of the last [`HISTORY_CONTEXT`] history entries.
    fn encode_context(
        &self,
        cwd: Option<&str>,
        history: &[String],
        partial: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let mut blended = scaled(&self.encode(partial)?, PARTIAL_WEIGHT);

        let dir_name = cwd
            .and_then(|cwd| Path::new(cwd).file_name())
            .map(|name| name.to_string_lossy().to_string());
        if let Some(name) = dir_name.filter(|n| !n.is_empty()) {
            add_scaled(&mut blended, &self.encode(&name)?, DIRECTORY_WEIGHT);
        }

        let recent: Vec<&String> = history
            .iter()
            .rev()
            .take(HISTORY_CONTEXT)
            .filter(|h| !h.trim().is_empty())
            .collect();
        if !recent.is_empty() {
            let mut mean = vec![0.0; self.dimensions()];
            for entry in &recent {
                add_scaled(&mut mean, &self.encode(entry)?, 1.0 / recent.len() as f32);
            }
            add_scaled(&mut blended, &mean, HISTORY_WEIGHT);
        }

        normalize(&mut blended);
        Ok(blended)
    }

    /// Adapt the provider to a fresh corpus of commands. Stateless providers
    /// have nothing to learn.
    fn retrain(&self, _corpus: &[String]) -> Result<(), EmbeddingError> {
        Ok(())
    }
}

/// Cosine similarity rescaled into [0, 1].
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.5;
    }
    let cosine = dot / (na.sqrt() * nb.sqrt());
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

fn scaled(v: &[f32], weight: f32) -> Vec<f32> {
    v.iter().map(|x| x * weight).collect()
}

fn add_scaled(acc: &mut [f32], v: &[f32], weight: f32) {
    for (a, x) in acc.iter_mut().zip(v) {
        *a += x * weight;
    }
}

pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        // crc32 is stable across builds, so persisted vectors stay valid
        let hash = crc32fast::hash(feature.as_bytes());
        let slot = (hash as usize) % self.dimensions;
        let sign = if hash & 0x8000_0000 == 0 { 1.0 } else { -1.0 };
        v[slot] += sign * weight;
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        HashingEmbedder::new(HashingEmbedder::DEFAULT_DIMENSIONS)
    }
}

impl EmbeddingProvider for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut v = vec![0.0; self.dimensions];
        for (i, token) in text.split_whitespace().enumerate() {
            // the program name says the most about intent
            let weight = if i == 0 { 2.0 } else { 1.0 };
            self.add_feature(&mut v, &format!("t:{}", token), weight);
        }
        let chars: Vec<char> = format!(" {} ", text).chars().collect();
        for gram in chars.windows(3) {
            let gram: String = gram.iter().collect();
            self.add_feature(&mut v, &format!("g:{}", gram), 0.5);
        }

        normalize(&mut v);
        Ok(v)
    }
}
