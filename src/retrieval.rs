//! Semantic retrieval of catalog variables for a question.
//!
//! The question is embedded with the configured [`EmbeddingProvider`] and
//! compared against every catalog embedding by cosine similarity. Results are
//! sorted by descending score; ties keep catalog insertion order (the sort is
//! stable), which keeps retrieval deterministic for a given embedding.

use std::sync::Arc;

use crate::catalog::VariableCatalog;
use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::EngineError;
use crate::models::{RetrievalResult, ScoredVariable};

/// Longest question accepted, in characters.
pub const MAX_QUESTION_CHARS: usize = 2000;

/// Trim and check a question before any network call.
pub fn validate_question(question: &str) -> Result<&str, EngineError> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput(
            "question must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_QUESTION_CHARS {
        return Err(EngineError::InvalidInput(format!(
            "question must be at most {} characters",
            MAX_QUESTION_CHARS
        )));
    }
    Ok(trimmed)
}

/// Ranks catalog variables against questions.
#[derive(Clone)]
pub struct Retriever {
    provider: Arc<dyn EmbeddingProvider>,
    top_k: usize,
}

impl Retriever {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, top_k: usize) -> Self {
        Self {
            provider,
            top_k: top_k.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Embed `question` and return the `top_k` closest catalog variables.
    pub async fn retrieve(
        &self,
        question: &str,
        catalog: &VariableCatalog,
    ) -> Result<RetrievalResult, EngineError> {
        let question = validate_question(question)?;

        if catalog.is_empty() {
            return Ok(RetrievalResult::default());
        }

        let query_vec = embed_query(self.provider.as_ref(), question)
            .await
            .map_err(|e| EngineError::EmbeddingService(format!("{:#}", e)))?;

        if query_vec.len() != catalog.dims() {
            return Err(EngineError::EmbeddingService(format!(
                "model '{}' returned {} dimensions but the catalog uses {}",
                self.provider.model_name(),
                query_vec.len(),
                catalog.dims()
            )));
        }

        if query_vec.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::EmbeddingService(format!(
                "model '{}' returned a non-finite embedding",
                self.provider.model_name()
            )));
        }

        let result = rank(&query_vec, catalog, self.top_k);
        tracing::debug!(
            variables = ?result.names(),
            "retrieved candidate variables"
        );
        Ok(result)
    }
}

/// Score every catalog record against `query_vec` and keep the best `k`.
pub fn rank(query_vec: &[f32], catalog: &VariableCatalog, k: usize) -> RetrievalResult {
    let mut scored: Vec<ScoredVariable> = catalog
        .records()
        .iter()
        .map(|record| ScoredVariable {
            score: cosine_similarity(query_vec, &record.embedding),
            variable: record.clone(),
        })
        .collect();

    sort_by_score(&mut scored);
    scored.truncate(k);

    RetrievalResult { items: scored }
}

/// Descending by score; NaN ranks last. Stable, so equal scores stay in
/// catalog order.
fn sort_by_score(scored: &mut [ScoredVariable]) {
    let key = |s: &ScoredVariable| {
        if s.score.is_nan() {
            f32::NEG_INFINITY
        } else {
            s.score
        }
    };
    scored.sort_by(|a, b| key(b).total_cmp(&key(a)));
}
