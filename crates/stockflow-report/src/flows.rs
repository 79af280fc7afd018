//! Pre-built report flows, wired the way the research pipeline runs:
//! a routing entry step fanning out to the single-stock, comparison,
//! and custom-research branches, all converging on composition.

use std::sync::Arc;

use stockflow_core::traits::{Embedder, ReportStore, VectorStore};
use stockflow_core::types::{DataClass, FetchParams, Granularity};
use stockflow_core::Result;
use stockflow_flow::{Flow, StepKind};
use stockflow_retrieval::RelevanceScorer;

use crate::analyze::{AnalyzeIndicatorsStep, CompareStocksStep};
use crate::compose::ComposeReportStep;
use crate::fetch::{BatchFetchStep, FetchClient, FetchDataStep};
use crate::query::{route, RouteQueryStep};
use crate::rag::RetrieveContextStep;

/// Everything the report steps need from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub fetch: Arc<FetchClient>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub reports: Arc<dyn ReportStore>,
    pub scorer: RelevanceScorer,
}

fn daily_prices() -> FetchParams {
    FetchParams::new(DataClass::Prices, Granularity::Daily)
}

/// fetch -> analyze -> compose. A failed analysis still composes from
/// the fetched data alone.
pub fn single_stock_flow(deps: &Collaborators) -> Result<Flow> {
    Flow::builder()
        .step(StepKind::sequential(FetchDataStep::new(
            Arc::clone(&deps.fetch),
            daily_prices(),
        )))
        .step(StepKind::batch(AnalyzeIndicatorsStep::new()))
        .step(StepKind::sequential(ComposeReportStep::new(Arc::clone(
            &deps.reports,
        ))))
        .on_default("fetch_data", "analyze_indicators")
        .on_default("analyze_indicators", "compose_report")
        .on_error("analyze_indicators", "compose_report")
        .build()
}

/// batch fetch -> compare -> compose, with comparison failures isolated
/// so the fetched data still reaches the report.
pub fn comparison_flow(deps: &Collaborators) -> Result<Flow> {
    Flow::builder()
        .step(StepKind::batch(BatchFetchStep::new(
            Arc::clone(&deps.fetch),
            daily_prices(),
        )))
        .step(StepKind::sequential(CompareStocksStep))
        .step(StepKind::sequential(ComposeReportStep::new(Arc::clone(
            &deps.reports,
        ))))
        .on_default("batch_fetch", "compare_stocks")
        .on_default("compare_stocks", "compose_report")
        .on_error("compare_stocks", "compose_report")
        .build()
}

/// retrieve -> compose.
pub fn custom_research_flow(deps: &Collaborators) -> Result<Flow> {
    Flow::builder()
        .step(StepKind::sequential(RetrieveContextStep::new(
            Arc::clone(&deps.embedder),
            Arc::clone(&deps.vectors),
            deps.scorer.clone(),
        )))
        .step(StepKind::sequential(ComposeReportStep::new(Arc::clone(
            &deps.reports,
        ))))
        .on_default("retrieve_context", "compose_report")
        .build()
}

/// The full research flow: route the query, then run whichever branch
/// it names. All branches converge on one composition step.
pub fn research_flow(deps: &Collaborators) -> Result<Flow> {
    Flow::builder()
        .step(StepKind::sequential(RouteQueryStep::new()))
        .step(StepKind::sequential(FetchDataStep::new(
            Arc::clone(&deps.fetch),
            daily_prices(),
        )))
        .step(StepKind::batch(AnalyzeIndicatorsStep::new()))
        .step(StepKind::batch(BatchFetchStep::new(
            Arc::clone(&deps.fetch),
            daily_prices(),
        )))
        .step(StepKind::sequential(CompareStocksStep))
        .step(StepKind::sequential(RetrieveContextStep::new(
            Arc::clone(&deps.embedder),
            Arc::clone(&deps.vectors),
            deps.scorer.clone(),
        )))
        .step(StepKind::sequential(ComposeReportStep::new(Arc::clone(
            &deps.reports,
        ))))
        .on_label("route_query", route::SINGLE_STOCK, "fetch_data")
        .on_label("route_query", route::COMPARE_STOCKS, "batch_fetch")
        .on_label("route_query", route::CUSTOM_QUERY, "retrieve_context")
        .on_default("fetch_data", "analyze_indicators")
        .on_default("analyze_indicators", "compose_report")
        .on_error("analyze_indicators", "compose_report")
        .on_default("batch_fetch", "compare_stocks")
        .on_default("compare_stocks", "compose_report")
        .on_error("compare_stocks", "compose_report")
        .on_default("retrieve_context", "compose_report")
        .build()
}
