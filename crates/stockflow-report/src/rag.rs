//! Research-context retrieval: embed the query, pull candidates from
//! the vector store, rank them, and stash the winners for composition.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use stockflow_core::context::{key, ns};
use stockflow_core::traits::{Embedder, VectorStore};
use stockflow_core::types::{Action, DocumentFilter, SectionId, StepId};
use stockflow_core::{Result, RunContext, StockflowError};
use stockflow_flow::{Step, StepInput, StepOutput};
use stockflow_retrieval::RelevanceScorer;

/// How many candidates to pull from the store before composite ranking.
const CANDIDATE_POOL: usize = 50;

pub struct RetrieveContextStep {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    scorer: RelevanceScorer,
    filter: DocumentFilter,
}

impl RetrieveContextStep {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        scorer: RelevanceScorer,
    ) -> Self {
        Self {
            embedder,
            store,
            scorer,
            filter: DocumentFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: DocumentFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Step for RetrieveContextStep {
    fn id(&self) -> StepId {
        StepId::from("retrieve_context")
    }

    fn section(&self) -> Option<SectionId> {
        Some(SectionId::from("research_context"))
    }

    fn prepare(&self, ctx: &RunContext) -> Result<StepInput> {
        let query = ctx
            .shared
            .get_str(&key(ns::INPUT, "query"))
            .ok_or_else(|| StockflowError::Validation("input.query is required".into()))?;
        Ok(json!({ "query": query }))
    }

    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let query = input["query"].as_str().unwrap_or_default().to_string();
            let embeddings = self.embedder.embed(&[query]).await?;
            let embedding = embeddings
                .into_iter()
                .next()
                .ok_or(StockflowError::RetrievalEmpty)?;
            let candidates = self
                .store
                .query(&embedding, &self.filter, CANDIDATE_POOL)
                .await?;
            debug!(candidates = candidates.len(), "ranking retrieval candidates");
            let ranked = self.scorer.rank(&embedding, candidates, Utc::now())?;
            let documents: Vec<serde_json::Value> = ranked
                .iter()
                .map(|scored| {
                    json!({
                        "id": scored.doc.id,
                        "content": scored.doc.content,
                        "source_type": scored.doc.source_type,
                        "published_at": scored.doc.published_at,
                        "score": scored.score,
                    })
                })
                .collect();
            Ok(json!(documents))
        })
    }

    /// An empty corpus degrades the section instead of failing the run.
    fn fallback(&self, _input: &StepInput) -> Option<StepOutput> {
        Some(json!([]))
    }

    fn commit(&self, ctx: &mut RunContext, _input: StepInput, output: StepOutput) -> Result<Action> {
        ctx.shared.set(key(ns::RAG, "documents"), output);
        Ok(Action::Default)
    }
}
