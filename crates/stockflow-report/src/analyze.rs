//! Technical indicator computation over fetched price series, plus the
//! cross-ticker comparison step.
//!
//! The indicator functions are pure and synchronous; the batch step
//! exists so each indicator is isolated and retried on its own.

use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use stockflow_core::context::{key, ns};
use stockflow_core::types::{Action, SectionId, StepId};
use stockflow_core::{Result, RunContext, StockflowError};
use stockflow_flow::{BatchStep, ItemOutcome, RetryPolicy, Step, StepInput, StepOutput};

/// Indicators computed for every analyzed stock.
pub const DEFAULT_INDICATORS: &[&str] = &["sma_20", "ema_12", "rsi_14", "volatility"];

/// Simple moving average over the trailing `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average with smoothing 2/(period+1).
pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value = closes[0];
    for close in &closes[1..] {
        value = alpha * close + (1.0 - alpha) * value;
    }
    Some(value)
}

/// Wilder RSI over the trailing `period` deltas, in [0, 100].
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let recent = &deltas[deltas.len() - period..];
    let gains: f64 = recent.iter().filter(|d| **d > 0.0).sum();
    let losses: f64 = -recent.iter().filter(|d| **d < 0.0).sum::<f64>();
    if losses == 0.0 {
        return Some(100.0);
    }
    let rs = (gains / period as f64) / (losses / period as f64);
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Population standard deviation of daily returns.
pub fn volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    Some(variance.sqrt())
}

fn compute_indicator(name: &str, closes: &[f64]) -> Result<f64> {
    let value = match name {
        "sma_20" => sma(closes, 20),
        "ema_12" => ema(closes, 12),
        "rsi_14" => rsi(closes, 14),
        "volatility" => volatility(closes),
        other => {
            return Err(StockflowError::Validation(format!(
                "unknown indicator '{other}'"
            )))
        }
    };
    value.ok_or_else(|| {
        StockflowError::Validation(format!("not enough price history for {name}"))
    })
}

/// Pull the daily close series out of a fetched stock payload.
pub fn closes_of(stock: &serde_json::Value) -> Vec<f64> {
    stock["price_data"]["daily"]
        .as_array()
        .map(|points| {
            points
                .iter()
                .filter_map(|p| p["close"].as_f64().or_else(|| p.as_f64()))
                .collect()
        })
        .unwrap_or_default()
}

/// Computes each configured indicator as an independent batch item over
/// `data.stock`, committing the table to `analysis.indicators`.
pub struct AnalyzeIndicatorsStep {
    indicators: Vec<String>,
}

impl AnalyzeIndicatorsStep {
    pub fn new() -> Self {
        Self {
            indicators: DEFAULT_INDICATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_indicators(indicators: Vec<String>) -> Self {
        Self { indicators }
    }
}

impl Default for AnalyzeIndicatorsStep {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStep for AnalyzeIndicatorsStep {
    fn id(&self) -> StepId {
        StepId::from("analyze_indicators")
    }

    fn section(&self) -> Option<SectionId> {
        Some(SectionId::from("indicators"))
    }

    fn retry(&self) -> RetryPolicy {
        // Pure math; a failure is deterministic and retrying is pointless.
        RetryPolicy::no_retry()
    }

    fn prepare(&self, ctx: &RunContext) -> Result<Vec<StepInput>> {
        let stock = ctx.shared.get(&key(ns::DATA, "stock")).ok_or_else(|| {
            StockflowError::Validation("data.stock missing, fetch must run first".into())
        })?;
        let closes = closes_of(stock);
        Ok(self
            .indicators
            .iter()
            .map(|name| json!({ "indicator": name, "closes": closes }))
            .collect())
    }

    fn compute_item<'a>(&'a self, item: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let name = item["indicator"].as_str().unwrap_or_default();
            let closes: Vec<f64> = serde_json::from_value(item["closes"].clone())?;
            let value = compute_indicator(name, &closes)?;
            Ok(json!(value))
        })
    }

    fn commit(
        &self,
        ctx: &mut RunContext,
        items: Vec<StepInput>,
        outcomes: Vec<ItemOutcome>,
    ) -> Result<Action> {
        let mut table = serde_json::Map::new();
        for (item, outcome) in items.iter().zip(&outcomes) {
            let name = item["indicator"].as_str().unwrap_or_default().to_string();
            match outcome {
                ItemOutcome::Ok { output } => {
                    table.insert(name, output.clone());
                }
                _ => {
                    table.insert(name, serde_json::Value::Null);
                }
            }
        }
        debug!(indicators = table.len(), "indicator table committed");
        ctx.shared.set(
            key(ns::ANALYSIS, "indicators"),
            serde_json::Value::Object(table),
        );
        Ok(Action::Default)
    }
}

/// Side-by-side comparison of the batch-fetched stocks.
pub struct CompareStocksStep;

impl Step for CompareStocksStep {
    fn id(&self) -> StepId {
        StepId::from("compare_stocks")
    }

    fn section(&self) -> Option<SectionId> {
        Some(SectionId::from("comparison"))
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::no_retry()
    }

    fn prepare(&self, ctx: &RunContext) -> Result<StepInput> {
        let stocks = ctx.shared.get(&key(ns::DATA, "stocks")).ok_or_else(|| {
            StockflowError::Validation("data.stocks missing, batch fetch must run first".into())
        })?;
        let count = stocks.as_object().map(|m| m.len()).unwrap_or(0);
        if count < 2 {
            return Err(StockflowError::Validation(
                "need at least two fetched stocks to compare".into(),
            ));
        }
        Ok(stocks.clone())
    }

    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let stocks = input.as_object().cloned().unwrap_or_default();
            let mut per_ticker = serde_json::Map::new();
            let mut ranked: Vec<(String, f64)> = Vec::new();
            for (ticker, stock) in &stocks {
                let closes = closes_of(stock);
                let momentum = rsi(&closes, 14).unwrap_or(50.0);
                per_ticker.insert(
                    ticker.clone(),
                    json!({
                        "sma_20": sma(&closes, 20),
                        "rsi_14": rsi(&closes, 14),
                        "volatility": volatility(&closes),
                        "last_close": closes.last(),
                    }),
                );
                ranked.push((ticker.clone(), momentum));
            }
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let insights: Vec<String> = ranked
                .first()
                .zip(ranked.last())
                .map(|(best, worst)| {
                    vec![
                        format!("{} shows the strongest momentum (RSI {:.1})", best.0, best.1),
                        format!("{} shows the weakest momentum (RSI {:.1})", worst.0, worst.1),
                    ]
                })
                .unwrap_or_default();
            Ok(json!({
                "tickers": ranked.iter().map(|(t, _)| t.clone()).collect::<Vec<_>>(),
                "indicator_comparison": per_ticker,
                "insights": insights,
            }))
        })
    }

    fn commit(&self, ctx: &mut RunContext, _input: StepInput, output: StepOutput) -> Result<Action> {
        ctx.shared.set(key(ns::ANALYSIS, "comparison"), output);
        Ok(Action::Default)
    }
}
