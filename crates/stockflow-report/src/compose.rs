//! Final composition: gather everything the run produced into report
//! sections, persist the report, and expose it in the context.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::info;

use stockflow_core::context::{key, ns};
use stockflow_core::traits::ReportStore;
use stockflow_core::types::{Action, ReportRecord, SectionId, StepId};
use stockflow_core::{Result, RunContext, StockflowError};
use stockflow_flow::{Step, StepInput, StepOutput};

/// Builds the report from whatever sections the run managed to produce
/// and saves it. Tolerant by design: missing inputs become omitted
/// sections, not errors, so isolated failures upstream still yield a
/// usable report.
pub struct ComposeReportStep {
    store: Arc<dyn ReportStore>,
}

impl ComposeReportStep {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    fn title_of(input: &StepInput) -> String {
        if let Some(ticker) = input["data"]["ticker"].as_str() {
            return format!("Research report: {ticker}");
        }
        if let Some(tickers) = input["data"]["stocks"].as_object() {
            let names: Vec<&str> = tickers.keys().map(String::as_str).collect();
            return format!("Comparison report: {}", names.join(" vs "));
        }
        let query = input["query"].as_str().unwrap_or("custom research");
        format!("Research brief: {query}")
    }

    fn sections_of(input: &StepInput) -> serde_json::Value {
        let mut sections = serde_json::Map::new();
        sections.insert(
            "overview".into(),
            json!({ "query": input["query"], "generated_at": Utc::now() }),
        );
        if !input["data"]["stock"].is_null() {
            sections.insert("market_data".into(), input["data"]["stock"].clone());
        }
        if !input["data"]["stocks"].is_null() {
            sections.insert("market_data".into(), input["data"]["stocks"].clone());
        }
        if !input["analysis"]["indicators"].is_null() {
            sections.insert("indicators".into(), input["analysis"]["indicators"].clone());
        }
        if !input["analysis"]["comparison"].is_null() {
            sections.insert("comparison".into(), input["analysis"]["comparison"].clone());
        }
        if !input["documents"].is_null() {
            sections.insert("research_context".into(), input["documents"].clone());
        }
        if !input["errors"].is_null() {
            sections.insert("caveats".into(), input["errors"].clone());
        }
        serde_json::Value::Object(sections)
    }
}

impl Step for ComposeReportStep {
    fn id(&self) -> StepId {
        StepId::from("compose_report")
    }

    fn section(&self) -> Option<SectionId> {
        Some(SectionId::from("report"))
    }

    fn prepare(&self, ctx: &RunContext) -> Result<StepInput> {
        let shared = &ctx.shared;
        if shared.get(&key(ns::DATA, "stock")).is_none()
            && shared.get(&key(ns::DATA, "stocks")).is_none()
            && shared.get(&key(ns::RAG, "documents")).is_none()
        {
            return Err(StockflowError::Validation(
                "nothing to compose: no data, analysis, or retrieved context".into(),
            ));
        }
        let errors: serde_json::Map<String, serde_json::Value> = shared
            .namespace(ns::ERRORS)
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Ok(json!({
            "run_id": ctx.run_id.to_string(),
            "query": shared.get(&key(ns::INPUT, "query")),
            "data": {
                "ticker": shared.get(&key(ns::DATA, "ticker")),
                "stock": shared.get(&key(ns::DATA, "stock")),
                "stocks": shared.get(&key(ns::DATA, "stocks")),
            },
            "analysis": {
                "indicators": shared.get(&key(ns::ANALYSIS, "indicators")),
                "comparison": shared.get(&key(ns::ANALYSIS, "comparison")),
            },
            "documents": shared.get(&key(ns::RAG, "documents")),
            "errors": if errors.is_empty() { serde_json::Value::Null } else { json!(errors) },
        }))
    }

    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let record = ReportRecord {
                id: input["run_id"].as_str().unwrap_or_default().to_string(),
                title: Self::title_of(input),
                created_at: Utc::now(),
                sections: Self::sections_of(input),
            };
            // Saving is keyed by run id, so a retried attempt replaces
            // its own earlier write.
            self.store.save(&record).await?;
            info!(report = %record.id, title = %record.title, "report saved");
            Ok(json!({
                "id": record.id,
                "title": record.title,
                "sections": record.sections,
            }))
        })
    }

    /// Unsaved report: same sections, flagged so the caller knows the
    /// store never accepted it.
    fn fallback(&self, input: &StepInput) -> Option<StepOutput> {
        Some(json!({
            "id": input["run_id"],
            "title": Self::title_of(input),
            "sections": Self::sections_of(input),
            "unsaved": true,
        }))
    }

    fn commit(&self, ctx: &mut RunContext, _input: StepInput, output: StepOutput) -> Result<Action> {
        ctx.shared.set(key(ns::REPORT, "id"), output["id"].clone());
        ctx.shared
            .set(key(ns::REPORT, "title"), output["title"].clone());
        ctx.shared
            .set(key(ns::REPORT, "sections"), output["sections"].clone());
        Ok(Action::Default)
    }
}
