use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use stockflow_core::config::CacheConfig;
use stockflow_core::error::{Result, StockflowError};
use stockflow_core::types::{DataClass, Granularity};

/// Cache key: what kind of data, for which identifier, at which granularity.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CacheKey {
    pub class: DataClass,
    pub ident: String,
    pub granularity: Granularity,
}

impl CacheKey {
    pub fn new(class: DataClass, ident: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            class,
            ident: ident.into(),
            granularity,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}/{:?}", self.class, self.ident, self.granularity)
    }
}

struct Entry {
    value: serde_json::Value,
    created: Instant,
    ttl: Duration,
    source: String,
    last_used: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created) > self.ttl
    }
}

/// TTL defaults per data class, plus the earnings-window refresh rule for
/// financial statements.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    intraday: Duration,
    historical: Duration,
    statements: Duration,
    indicators: Duration,
    earnings_window: chrono::Duration,
}

impl TtlPolicy {
    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self {
            intraday: Duration::from_secs(cfg.intraday_ttl_secs),
            historical: Duration::from_secs(cfg.historical_ttl_secs),
            statements: Duration::from_secs(cfg.statements_ttl_secs),
            indicators: Duration::from_secs(cfg.indicators_ttl_secs),
            earnings_window: chrono::Duration::hours(cfg.earnings_window_hours as i64),
        }
    }

    pub fn ttl_for(&self, class: DataClass, granularity: Granularity) -> Duration {
        match class {
            DataClass::Prices => match granularity {
                Granularity::Intraday => self.intraday,
                _ => self.historical,
            },
            DataClass::Statements => self.statements,
            DataClass::Indicators => self.indicators,
        }
    }

    /// Cached financial statements must be refreshed when the request falls
    /// inside the configured window around a known earnings date,
    /// regardless of remaining TTL.
    pub fn force_refresh(
        &self,
        class: DataClass,
        now: DateTime<Utc>,
        earnings_date: Option<DateTime<Utc>>,
    ) -> bool {
        if class != DataClass::Statements {
            return false;
        }
        match earnings_date {
            Some(when) => (when - now).abs() <= self.earnings_window,
            None => false,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

/// Capacity-bounded TTL cache for externally fetched data.
///
/// Expired reads are misses, never stale hits. Inserting past capacity
/// evicts the least-recently-used entry independent of its remaining TTL.
/// `get_or_fetch` deduplicates concurrent misses per key; unrelated keys
/// never contend on one lock.
pub struct CacheManager {
    entries: DashMap<CacheKey, Entry>,
    pending: DashMap<CacheKey, Arc<Mutex<()>>>,
    capacity: usize,
}

impl CacheManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            pending: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up a value. Expired entries are removed and reported as misses.
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.expired(now) {
                    true
                } else {
                    entry.last_used = now;
                    return Some(entry.value.clone());
                }
            }
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            debug!(%key, "cache entry expired");
        }
        None
    }

    /// Typed lookup. An entry that no longer deserializes is evicted and
    /// reported as `CacheCorruption`; callers treat that as a miss.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(t) => Ok(Some(t)),
            Err(e) => {
                self.entries.remove(key);
                warn!(%key, error = %e, "evicting corrupt cache entry");
                Err(StockflowError::CacheCorruption(key.to_string()))
            }
        }
    }

    /// Insert a value, replacing any previous entry wholesale, then evict
    /// least-recently-used entries while over capacity.
    pub fn set(&self, key: CacheKey, value: serde_json::Value, ttl: Duration, source: &str) {
        let now = Instant::now();
        self.entries.insert(
            key,
            Entry {
                value,
                created: now,
                ttl,
                source: source.to_string(),
                last_used: now,
            },
        );
        while self.entries.len() > self.capacity {
            if !self.evict_lru() {
                break;
            }
        }
    }

    /// Remove one entry regardless of TTL.
    pub fn invalidate(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    /// Source tag recorded for a live entry, if present.
    pub fn source_of(&self, key: &CacheKey) -> Option<String> {
        self.entries.get(key).map(|e| e.source.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit-or-fetch with per-key in-flight deduplication: concurrent misses
    /// on the same key run the fetch once; other keys proceed untouched.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        source: &str,
        fetch: F,
    ) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let gate = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = gate.lock().await;

        // Another task may have populated the entry while we waited.
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let result = fetch().await;
        self.pending.remove(key);
        let value = result?;
        self.set(key.clone(), value.clone(), ttl, source);
        Ok(value)
    }

    fn evict_lru(&self) -> bool {
        let mut victim: Option<(CacheKey, Instant)> = None;
        for entry in self.entries.iter() {
            let stamp = entry.value().last_used;
            match &victim {
                Some((_, oldest)) if *oldest <= stamp => {}
                _ => victim = Some((entry.key().clone(), stamp)),
            }
        }
        match victim {
            Some((key, _)) => {
                debug!(%key, "evicting least-recently-used cache entry");
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prices_key(ticker: &str) -> CacheKey {
        CacheKey::new(DataClass::Prices, ticker, Granularity::Intraday)
    }

    #[tokio::test]
    async fn test_get_after_set_returns_identical_value() {
        let cache = CacheManager::new(8);
        let value = json!({"ticker": "AAPL", "close": 189.7});
        cache.set(prices_key("AAPL"), value.clone(), Duration::from_secs(60), "fixture");

        assert_eq!(cache.get(&prices_key("AAPL")), Some(value));
        assert_eq!(cache.source_of(&prices_key("AAPL")).as_deref(), Some("fixture"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_is_a_miss() {
        // Scenario: 15 minute TTL, hit at t=10m, miss at t=16m.
        let cache = CacheManager::new(8);
        cache.set(
            prices_key("AAPL"),
            json!({"close": 189.7}),
            Duration::from_secs(15 * 60),
            "fixture",
        );

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert!(cache.get(&prices_key("AAPL")).is_some());

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert!(cache.get(&prices_key("AAPL")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_after_expiry_replaces_wholesale() {
        let cache = CacheManager::new(8);
        cache.set(prices_key("AAPL"), json!({"close": 1.0, "stale": true}), Duration::from_secs(1), "a");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&prices_key("AAPL")).is_none());

        cache.set(prices_key("AAPL"), json!({"close": 2.0}), Duration::from_secs(60), "b");
        let fresh = cache.get(&prices_key("AAPL")).unwrap();
        assert_eq!(fresh, json!({"close": 2.0}));
        assert!(fresh.get("stale").is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let cache = CacheManager::new(2);
        cache.set(prices_key("AAPL"), json!(1), Duration::from_secs(600), "s");
        cache.set(prices_key("MSFT"), json!(2), Duration::from_secs(600), "s");

        // Touch AAPL so MSFT becomes least recently used.
        cache.get(&prices_key("AAPL"));
        cache.set(prices_key("NVDA"), json!(3), Duration::from_secs(600), "s");

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&prices_key("AAPL")).is_some());
        assert!(cache.get(&prices_key("MSFT")).is_none());
        assert!(cache.get(&prices_key("NVDA")).is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_evicted_and_reported() {
        #[derive(Debug, Deserialize)]
        struct Quote {
            #[allow(dead_code)]
            close: f64,
        }

        let cache = CacheManager::new(8);
        cache.set(prices_key("AAPL"), json!({"close": "not a number"}), Duration::from_secs(60), "s");

        let err = cache.get_typed::<Quote>(&prices_key("AAPL")).unwrap_err();
        assert!(matches!(err, StockflowError::CacheCorruption(_)));
        // Entry was evicted: the next read is a clean miss.
        assert_eq!(cache.get_typed::<Quote>(&prices_key("AAPL")).unwrap().map(|q| q.close), None);
    }

    #[tokio::test]
    async fn test_get_or_fetch_deduplicates_concurrent_misses() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let cache = Arc::new(CacheManager::new(8));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&prices_key("AAPL"), Duration::from_secs(60), "s", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(json!({"close": 189.7}))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), json!({"close": 189.7}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch_error_leaves_no_entry() {
        let cache = CacheManager::new(8);
        let res = cache
            .get_or_fetch(&prices_key("AAPL"), Duration::from_secs(60), "s", || async {
                Err(StockflowError::DataUnavailable {
                    source: "s".into(),
                    message: "down".into(),
                })
            })
            .await;
        assert!(res.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_policy_defaults() {
        let policy = TtlPolicy::default();
        assert_eq!(
            policy.ttl_for(DataClass::Prices, Granularity::Intraday),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(
            policy.ttl_for(DataClass::Prices, Granularity::Weekly),
            Duration::from_secs(4 * 60 * 60)
        );
        assert_eq!(
            policy.ttl_for(DataClass::Statements, Granularity::Daily),
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(
            policy.ttl_for(DataClass::Indicators, Granularity::Daily),
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn test_earnings_window_forces_statement_refresh() {
        let policy = TtlPolicy::default(); // 48h window
        let now = Utc::now();

        let inside = Some(now + chrono::Duration::hours(24));
        let outside = Some(now + chrono::Duration::hours(100));

        assert!(policy.force_refresh(DataClass::Statements, now, inside));
        assert!(policy.force_refresh(DataClass::Statements, now, Some(now - chrono::Duration::hours(24))));
        assert!(!policy.force_refresh(DataClass::Statements, now, outside));
        assert!(!policy.force_refresh(DataClass::Statements, now, None));
        // Only statements are subject to the earnings window.
        assert!(!policy.force_refresh(DataClass::Prices, now, inside));
    }
}
