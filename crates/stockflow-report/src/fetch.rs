//! Cached, rate-limited market data fetching with a primary and an
//! optional fallback source.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use stockflow_cache::{CacheKey, CacheManager, RateLimiter, TtlPolicy};
use stockflow_core::context::{key, ns};
use stockflow_core::traits::DataSource;
use stockflow_core::types::{Action, FetchParams, SectionId, StepId};
use stockflow_core::{Result, RunContext, StockflowError};
use stockflow_flow::{all_items_failed, BatchStep, ItemOutcome, Step, StepInput, StepOutput};

/// Shared fetch path: cache lookup, per-source rate limiting, primary
/// source with fallback. Process-wide; steps hold it behind an `Arc`.
pub struct FetchClient {
    cache: Arc<CacheManager>,
    limiter: Arc<RateLimiter>,
    ttl: TtlPolicy,
    primary: Arc<dyn DataSource>,
    fallback: Option<Arc<dyn DataSource>>,
    /// Known upcoming earnings dates by ticker; statements inside the
    /// configured window around one are refetched regardless of TTL.
    earnings: HashMap<String, DateTime<Utc>>,
}

impl FetchClient {
    pub fn new(
        cache: Arc<CacheManager>,
        limiter: Arc<RateLimiter>,
        ttl: TtlPolicy,
        primary: Arc<dyn DataSource>,
        fallback: Option<Arc<dyn DataSource>>,
    ) -> Self {
        Self {
            cache,
            limiter,
            ttl,
            primary,
            fallback,
            earnings: HashMap::new(),
        }
    }

    pub fn with_earnings_calendar(mut self, earnings: HashMap<String, DateTime<Utc>>) -> Self {
        self.earnings = earnings;
        self
    }

    pub async fn fetch(&self, ticker: &str, params: &FetchParams) -> Result<serde_json::Value> {
        let ticker = ticker.trim().to_uppercase();
        let cache_key = CacheKey::new(params.class, ticker.clone(), params.granularity);

        let earnings_date = self.earnings.get(&ticker).copied();
        if self
            .ttl
            .force_refresh(params.class, Utc::now(), earnings_date)
        {
            debug!(%ticker, "inside earnings window, bypassing cached statements");
            self.cache.invalidate(&cache_key);
        }

        let ttl = self.ttl.ttl_for(params.class, params.granularity);
        self.cache
            .get_or_fetch(&cache_key, ttl, self.primary.id(), || {
                self.fetch_uncached(&ticker, params)
            })
            .await
    }

    async fn fetch_uncached(
        &self,
        ticker: &str,
        params: &FetchParams,
    ) -> Result<serde_json::Value> {
        match self.from_source(self.primary.as_ref(), ticker, params).await {
            Ok(value) => Ok(value),
            Err(primary_err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(primary_err);
                };
                warn!(
                    %ticker,
                    source = self.primary.id(),
                    error = %primary_err,
                    "primary source failed, trying fallback"
                );
                self.from_source(fallback.as_ref(), ticker, params)
                    .await
                    .map_err(|fallback_err| StockflowError::DataUnavailable {
                        source: format!("{}+{}", self.primary.id(), fallback.id()),
                        message: format!("primary: {primary_err}; fallback: {fallback_err}"),
                    })
            }
        }
    }

    async fn from_source(
        &self,
        source: &dyn DataSource,
        ticker: &str,
        params: &FetchParams,
    ) -> Result<serde_json::Value> {
        self.limiter.acquire(source.id()).await?;
        source.fetch(ticker, params).await
    }
}

/// Fetches data for the first routed ticker into `data.stock`.
pub struct FetchDataStep {
    client: Arc<FetchClient>,
    params: FetchParams,
}

impl FetchDataStep {
    pub fn new(client: Arc<FetchClient>, params: FetchParams) -> Self {
        Self { client, params }
    }
}

impl Step for FetchDataStep {
    fn id(&self) -> StepId {
        StepId::from("fetch_data")
    }

    fn section(&self) -> Option<SectionId> {
        Some(SectionId::from("market_data"))
    }

    fn prepare(&self, ctx: &RunContext) -> Result<StepInput> {
        let ticker = ctx
            .shared
            .get(&key(ns::INPUT, "tickers"))
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                StockflowError::Validation("input.tickers must name at least one ticker".into())
            })?;
        Ok(json!({ "ticker": ticker }))
    }

    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let ticker = input["ticker"].as_str().unwrap_or_default();
            self.client.fetch(ticker, &self.params).await
        })
    }

    fn commit(&self, ctx: &mut RunContext, input: StepInput, output: StepOutput) -> Result<Action> {
        ctx.shared.set(
            key(ns::DATA, "ticker"),
            input["ticker"].clone(),
        );
        ctx.shared.set(key(ns::DATA, "stock"), output);
        Ok(Action::Default)
    }
}

/// Fan-out fetch for comparison runs: one item per routed ticker, results
/// collected into the `data.stocks` map keyed by ticker.
pub struct BatchFetchStep {
    client: Arc<FetchClient>,
    params: FetchParams,
}

impl BatchFetchStep {
    pub fn new(client: Arc<FetchClient>, params: FetchParams) -> Self {
        Self { client, params }
    }
}

impl BatchStep for BatchFetchStep {
    fn id(&self) -> StepId {
        StepId::from("batch_fetch")
    }

    fn section(&self) -> Option<SectionId> {
        Some(SectionId::from("market_data"))
    }

    fn prepare(&self, ctx: &RunContext) -> Result<Vec<StepInput>> {
        let tickers: Vec<String> = ctx
            .shared
            .get(&key(ns::INPUT, "tickers"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        if tickers.len() < 2 {
            return Err(StockflowError::Validation(
                "comparison needs at least two tickers".into(),
            ));
        }
        Ok(tickers.into_iter().map(|t| json!(t)).collect())
    }

    fn compute_item<'a>(&'a self, item: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            let ticker = item.as_str().unwrap_or_default();
            self.client.fetch(ticker, &self.params).await
        })
    }

    fn commit(
        &self,
        ctx: &mut RunContext,
        items: Vec<StepInput>,
        outcomes: Vec<ItemOutcome>,
    ) -> Result<Action> {
        if all_items_failed(&outcomes) {
            return Err(StockflowError::DataUnavailable {
                source: "batch_fetch".into(),
                message: "every ticker fetch failed".into(),
            });
        }
        let mut stocks = serde_json::Map::new();
        for (item, outcome) in items.iter().zip(&outcomes) {
            if let (Some(ticker), Some(output)) = (item.as_str(), outcome.output()) {
                stocks.insert(ticker.to_string(), output.clone());
            }
        }
        ctx.shared
            .set(key(ns::DATA, "stocks"), serde_json::Value::Object(stocks));
        Ok(Action::Default)
    }
}
