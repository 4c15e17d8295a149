//! Expected-vs-actual comparison: normalized equality plus embedding cosine
//! similarity, with a per-run embedding memo shared across concurrent pairs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::error::AppError;

use super::provider::ModelProvider;
use super::types::ModelRef;

/// Result of comparing an expected text with the model's actual text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub is_equal: bool,
    pub similarity: f64,
}

impl Comparison {
    pub const EQUAL: Comparison = Comparison {
        is_equal: true,
        similarity: 1.0,
    };

    pub const NONE: Comparison = Comparison {
        is_equal: false,
        similarity: 0.0,
    };
}

/// Trim and collapse internal whitespace runs to a single space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-sensitive equality after whitespace normalization.
pub fn texts_equal(expected: &str, actual: &str) -> bool {
    normalize(expected) == normalize(actual)
}

/// Cosine similarity clamped to `[0, 1]`. Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// The comparison when it needs no embeddings: an empty side, or equal texts.
pub fn quick_compare(expected: &str, actual: &str) -> Option<Comparison> {
    if expected.trim().is_empty() || actual.trim().is_empty() {
        Some(Comparison::NONE)
    } else if texts_equal(expected, actual) {
        Some(Comparison::EQUAL)
    } else {
        None
    }
}

// ============================================================================
// EmbeddingCache
// ============================================================================

type CacheKey = (String, String);

/// Per-text embedding memo keyed by `(model, text)`.
///
/// The map lock is held only long enough to fetch the per-key cell; the
/// provider call runs under the cell's own init lock, so two pairs asking
/// for the same text wait on one request. Failed calls are not cached.
#[derive(Default)]
pub struct EmbeddingCache {
    cells: Mutex<HashMap<CacheKey, Arc<OnceCell<Arc<Vec<f32>>>>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_embed(
        &self,
        provider: &dyn ModelProvider,
        model: &ModelRef,
        text: &str,
    ) -> Result<Arc<Vec<f32>>, AppError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry((model.to_string(), text.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let vector = cell
            .get_or_try_init(|| async {
                provider
                    .embed(text, model)
                    .await
                    .map(Arc::new)
                    .map_err(|e| match e {
                        AppError::Embedding(_) => e,
                        other => AppError::Embedding(other.to_string()),
                    })
            })
            .await?;
        Ok(vector.clone())
    }

    /// Number of texts with a stored embedding.
    pub async fn len(&self) -> usize {
        let cells = self.cells.lock().await;
        cells.values().filter(|c| c.initialized()).count()
    }
}

// ============================================================================
// ScoreComparator
// ============================================================================

pub struct ScoreComparator {
    provider: Arc<dyn ModelProvider>,
    cache: Arc<EmbeddingCache>,
}

impl ScoreComparator {
    pub fn new(provider: Arc<dyn ModelProvider>, cache: Arc<EmbeddingCache>) -> Self {
        Self { provider, cache }
    }

    /// Compare `expected` and `actual`.
    ///
    /// Either text empty yields similarity 0 and is never equal. Equal texts
    /// short-circuit to similarity 1 without any embedding call. Embedding failures surface as
    /// `AppError::Embedding`; the caller decides how to score them.
    pub async fn compare(
        &self,
        expected: &str,
        actual: &str,
        embedding_model: &ModelRef,
    ) -> Result<Comparison, AppError> {
        if let Some(decided) = quick_compare(expected, actual) {
            return Ok(decided);
        }

        let a = self
            .cache
            .get_or_embed(self.provider.as_ref(), embedding_model, expected)
            .await?;
        let b = self
            .cache
            .get_or_embed(self.provider.as_ref(), embedding_model, actual)
            .await?;

        Ok(Comparison {
            is_equal: false,
            similarity: cosine_similarity(&a, &b),
        })
    }
}
