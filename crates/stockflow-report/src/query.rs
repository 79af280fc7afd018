//! Free-form query parsing and the routing step that starts every run.

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use stockflow_core::context::{key, ns};
use stockflow_core::types::{Action, Severity, StepId};
use stockflow_core::{Result, RunContext, SharedContext, StockflowError};
use stockflow_flow::{RetryPolicy, Step, StepInput, StepOutput};

/// Words that match the ticker pattern but never are tickers.
const STOPLIST: &[&str] = &[
    "A", "I", "AM", "AN", "AND", "AS", "AT", "BE", "BY", "FOR", "IN", "IS", "IT", "OF", "ON",
    "OR", "TO", "VS",
];

const COMPARISON_KEYWORDS: &[&str] = &["COMPARE", "VS", "VERSUS", "AGAINST", "AND"];

/// Routing labels produced by the entry step.
pub mod route {
    pub const SINGLE_STOCK: &str = "single_stock";
    pub const COMPARE_STOCKS: &str = "compare_stocks";
    pub const CUSTOM_QUERY: &str = "custom_query";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    SingleStock,
    CompareStocks,
    CustomQuery,
}

impl QueryKind {
    pub fn as_route(&self) -> &'static str {
        match self {
            QueryKind::SingleStock => route::SINGLE_STOCK,
            QueryKind::CompareStocks => route::COMPARE_STOCKS,
            QueryKind::CustomQuery => route::CUSTOM_QUERY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub kind: QueryKind,
    pub tickers: Vec<String>,
    pub raw: String,
}

/// Classifies queries into single-stock, comparison, or custom research.
#[derive(Debug, Clone)]
pub struct QueryParser {
    ticker_pattern: Regex,
    single_pattern: Regex,
}

impl Default for QueryParser {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryParser {
    pub fn new() -> Self {
        Self {
            ticker_pattern: Regex::new(r"\b[A-Z]{1,5}\b").unwrap(),
            single_pattern: Regex::new(r"^[A-Z]{1,5}$").unwrap(),
        }
    }

    pub fn parse(&self, query: &str) -> ParsedQuery {
        let trimmed = query.trim();
        let upper = trimmed.to_uppercase();

        if self.single_pattern.is_match(&upper) && !STOPLIST.contains(&upper.as_str()) {
            return ParsedQuery {
                kind: QueryKind::SingleStock,
                tickers: vec![upper],
                raw: trimmed.to_string(),
            };
        }

        let tickers = self.extract_tickers(&upper);
        let has_comparison_word = upper
            .split_whitespace()
            .any(|word| COMPARISON_KEYWORDS.contains(&word));
        if has_comparison_word && tickers.len() >= 2 {
            return ParsedQuery {
                kind: QueryKind::CompareStocks,
                tickers,
                raw: trimmed.to_string(),
            };
        }

        ParsedQuery {
            kind: QueryKind::CustomQuery,
            tickers,
            raw: trimmed.to_string(),
        }
    }

    /// All ticker-shaped words in the query, stoplist filtered, order
    /// preserved, duplicates removed.
    pub fn extract_tickers(&self, upper: &str) -> Vec<String> {
        let mut tickers = Vec::new();
        for m in self.ticker_pattern.find_iter(upper) {
            let candidate = m.as_str();
            if STOPLIST.contains(&candidate) {
                continue;
            }
            if !tickers.iter().any(|t| t == candidate) {
                tickers.push(candidate.to_string());
            }
        }
        tickers
    }
}

/// Reject runs whose initial context cannot possibly produce a report.
pub fn validate_initial_context(shared: &SharedContext) -> Result<()> {
    match shared.get_str(&key(ns::INPUT, "query")) {
        Some(query) if !query.trim().is_empty() => Ok(()),
        Some(_) => Err(StockflowError::Validation(
            "input.query must not be empty".into(),
        )),
        None => Err(StockflowError::Validation(
            "input.query is required".into(),
        )),
    }
}

/// Entry step of the research flow: parses `input.query` and routes to
/// the single-stock, comparison, or custom-research branch.
pub struct RouteQueryStep {
    parser: QueryParser,
}

impl RouteQueryStep {
    pub fn new() -> Self {
        Self {
            parser: QueryParser::new(),
        }
    }
}

impl Default for RouteQueryStep {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for RouteQueryStep {
    fn id(&self) -> StepId {
        StepId::from("route_query")
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }

    fn severity_on_failure(&self) -> Severity {
        // Nothing downstream can run without a routed query.
        Severity::Critical
    }

    fn prepare(&self, ctx: &RunContext) -> Result<StepInput> {
        validate_initial_context(&ctx.shared)?;
        let query = ctx
            .shared
            .get_str(&key(ns::INPUT, "query"))
            .unwrap_or_default();
        Ok(json!({ "query": query }))
    }

    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let query = input["query"].as_str().unwrap_or_default();
            let parsed = self.parser.parse(query);
            Ok(serde_json::to_value(parsed)?)
        })
    }

    fn commit(&self, ctx: &mut RunContext, _input: StepInput, output: StepOutput) -> Result<Action> {
        let parsed: ParsedQuery = serde_json::from_value(output)?;
        info!(kind = parsed.kind.as_route(), tickers = ?parsed.tickers, "query routed");
        ctx.shared
            .set(key(ns::INPUT, "tickers"), json!(parsed.tickers));
        ctx.shared
            .set(key(ns::INPUT, "kind"), json!(parsed.kind.as_route()));
        Ok(Action::label(parsed.kind.as_route()))
    }
}
