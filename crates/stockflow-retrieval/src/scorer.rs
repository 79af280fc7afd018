use chrono::{DateTime, Utc};
use serde::Serialize;

use stockflow_core::config::RetrievalConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::Document;

/// A candidate document with its composite relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct Scored {
    pub doc: Document,
    pub score: f64,
}

/// Deterministic composite ranking over candidate documents.
///
/// `score = w_sem * semantic + w_temp * temporal + w_rel * reliability`,
/// each component normalized to [0, 1] before weighting. Identical inputs
/// always yield an identical ordering.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    semantic_weight: f64,
    temporal_weight: f64,
    reliability_weight: f64,
    half_life_days: f64,
    top_k: usize,
    min_score: f64,
}

impl RelevanceScorer {
    pub fn from_config(cfg: &RetrievalConfig) -> Self {
        Self {
            semantic_weight: cfg.semantic_weight,
            temporal_weight: cfg.temporal_weight,
            reliability_weight: cfg.reliability_weight,
            half_life_days: cfg.half_life_days.max(f64::MIN_POSITIVE),
            top_k: cfg.top_k,
            min_score: cfg.min_score,
        }
    }

    /// Score one document against a query embedding at a fixed point in
    /// time. Always in [0, 1].
    pub fn score(&self, query: &[f32], doc: &Document, as_of: DateTime<Utc>) -> f64 {
        let semantic = (cosine_similarity(query, &doc.embedding) as f64 + 1.0) / 2.0;
        let temporal = self.temporal(doc.published_at, as_of);
        let reliability = doc.source_type.reliability();

        (self.semantic_weight * semantic.clamp(0.0, 1.0)
            + self.temporal_weight * temporal
            + self.reliability_weight * reliability)
            .clamp(0.0, 1.0)
    }

    /// Exponential half-life decay: 1 at age zero, monotone non-increasing
    /// with age, bounded in [0, 1]. Future-dated documents count as age 0.
    fn temporal(&self, published_at: DateTime<Utc>, as_of: DateTime<Utc>) -> f64 {
        let age_days = (as_of - published_at).num_seconds().max(0) as f64 / 86_400.0;
        0.5_f64.powf(age_days / self.half_life_days)
    }

    /// Rank candidates: drop everything below the minimum score, order by
    /// descending score (ties broken by newer document, then id), truncate
    /// to top-K. `RetrievalEmpty` when nothing clears the threshold —
    /// callers that tolerate an empty retrieval context match on it.
    pub fn rank(
        &self,
        query: &[f32],
        candidates: Vec<Document>,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Scored>> {
        let mut scored: Vec<Scored> = candidates
            .into_iter()
            .map(|doc| Scored {
                score: self.score(query, &doc, as_of),
                doc,
            })
            .filter(|s| s.score >= self.min_score)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.doc.published_at.cmp(&a.doc.published_at))
                .then_with(|| a.doc.id.cmp(&b.doc.id))
        });
        scored.truncate(self.top_k);

        if scored.is_empty() {
            return Err(StockflowError::RetrievalEmpty);
        }
        Ok(scored)
    }
}

/// Compute cosine similarity between two vectors.
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
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
