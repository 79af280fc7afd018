use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{Document, DocumentFilter, FetchParams, ReportRecord};

/// External data source — structured financial data per ticker.
///
/// Fetch failures surface as `StockflowError::DataUnavailable`; the fetch
/// steps decide whether to fall back to another source.
pub trait DataSource: Send + Sync + 'static {
    /// Source id, used for rate limiting and cache source tags.
    fn id(&self) -> &str;

    /// Fetch structured data for a ticker.
    fn fetch(&self, ticker: &str, params: &FetchParams)
        -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Embedding provider for retrieval queries and document ingestion.
pub trait Embedder: Send + Sync + 'static {
    /// Embed a batch of texts into vectors.
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>>;

    /// Number of dimensions in the embedding vectors.
    fn dimensions(&self) -> usize;
}

/// Vector store — document persistence plus similarity-filtered candidates.
pub trait VectorStore: Send + Sync + 'static {
    /// Insert or replace a document.
    fn upsert(&self, doc: &Document) -> BoxFuture<'_, Result<()>>;

    /// Return up to `top_k` candidates matching the filter, ordered by
    /// raw similarity to the query embedding. Composite relevance scoring
    /// is the caller's concern.
    fn query(
        &self,
        embedding: &[f32],
        filter: &DocumentFilter,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<Document>>>;
}

/// Report persistence backend.
pub trait ReportStore: Send + Sync + 'static {
    fn save(&self, report: &ReportRecord) -> BoxFuture<'_, Result<()>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<ReportRecord>>>;

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<()>>;
}
