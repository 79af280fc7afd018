use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StockflowError};

/// Top-level stockflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-source rate limit policies, keyed by source id.
    #[serde(default)]
    pub sources: HashMap<String, RateLimitConfig>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Flow engine and step executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Max visits to the same step in one run before the engine breaks out.
    #[serde(default = "default_max_step_visits")]
    pub max_step_visits: u32,
    /// Concurrency limit for batch-step item execution.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
    /// Default retry policy used by steps that do not declare their own.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_step_visits: default_max_step_visits(),
            batch_concurrency: default_batch_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_step_visits() -> u32 { 5 }
fn default_batch_concurrency() -> usize { 4 }

/// Retry configuration for one step's compute phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Fixed backoff when false, exponential when true.
    #[serde(default = "default_exponential")]
    pub exponential: bool,
    /// Per-attempt compute timeout in seconds. None = no timeout.
    #[serde(default = "default_compute_timeout")]
    pub timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            exponential: default_exponential(),
            timeout_secs: default_compute_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 15_000 }
fn default_exponential() -> bool { true }
fn default_compute_timeout() -> Option<u64> { Some(30) }

/// Cache manager settings. TTLs follow the data-class policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Intraday price data TTL in seconds. Default: 15 minutes.
    #[serde(default = "default_intraday_ttl")]
    pub intraday_ttl_secs: u64,
    /// Weekly/monthly price data TTL in seconds. Default: 4 hours.
    #[serde(default = "default_historical_ttl")]
    pub historical_ttl_secs: u64,
    /// Financial statement TTL in seconds. Default: 24 hours.
    #[serde(default = "default_statements_ttl")]
    pub statements_ttl_secs: u64,
    /// Indicator calculation TTL in seconds. Default: 15 minutes.
    #[serde(default = "default_indicators_ttl")]
    pub indicators_ttl_secs: u64,
    /// Window around a known earnings date (hours) inside which cached
    /// financial statements are force-refreshed.
    #[serde(default = "default_earnings_window")]
    pub earnings_window_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            intraday_ttl_secs: default_intraday_ttl(),
            historical_ttl_secs: default_historical_ttl(),
            statements_ttl_secs: default_statements_ttl(),
            indicators_ttl_secs: default_indicators_ttl(),
            earnings_window_hours: default_earnings_window(),
        }
    }
}

fn default_cache_capacity() -> usize { 512 }
fn default_intraday_ttl() -> u64 { 15 * 60 }
fn default_historical_ttl() -> u64 { 4 * 60 * 60 }
fn default_statements_ttl() -> u64 { 24 * 60 * 60 }
fn default_indicators_ttl() -> u64 { 15 * 60 }
fn default_earnings_window() -> u64 { 48 }

/// Token bucket policy for one external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute; also the bucket capacity.
    pub requests_per_minute: u32,
    /// Cooldown after exhaustion, in seconds.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Max time an acquire may wait before failing, in seconds.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

fn default_cooldown() -> u64 { 60 }
fn default_max_wait() -> u64 { 10 }

/// Relevance scoring and retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_temporal_weight")]
    pub temporal_weight: f64,
    #[serde(default = "default_reliability_weight")]
    pub reliability_weight: f64,
    /// Half-life of the temporal decay, in days.
    #[serde(default = "default_half_life")]
    pub half_life_days: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            temporal_weight: default_temporal_weight(),
            reliability_weight: default_reliability_weight(),
            half_life_days: default_half_life(),
            top_k: default_top_k(),
            min_score: default_min_score(),
        }
    }
}

fn default_semantic_weight() -> f64 { 0.6 }
fn default_temporal_weight() -> f64 { 0.2 }
fn default_reliability_weight() -> f64 { 0.2 }
fn default_half_life() -> f64 { 30.0 }
fn default_top_k() -> usize { 5 }
fn default_min_score() -> f64 { 0.35 }

/// Local storage locations used by the CLI wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database for documents and saved reports.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Directory of JSON fixtures served by the file data source.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_db_path() -> String { "stockflow.db".to_string() }
fn default_data_dir() -> String { "data".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with `${ENV_VAR}` expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StockflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StockflowError::Config(e.to_string()))
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.db_path)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STOCKFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STOCKFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STOCKFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STOCKFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STOCKFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.flow.max_step_visits, 5);
        assert_eq!(config.flow.batch_concurrency, 4);
        assert_eq!(config.flow.retry.max_attempts, 3);
        assert_eq!(config.cache.intraday_ttl_secs, 15 * 60);
        assert_eq!(config.cache.statements_ttl_secs, 24 * 60 * 60);
        assert_eq!(config.retrieval.semantic_weight, 0.6);
        assert_eq!(config.retrieval.top_k, 5);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_source_policies_from_toml() {
        let toml_str = r#"
[sources.alphavantage]
requests_per_minute = 30
cooldown_secs = 60

[sources.newswire]
requests_per_minute = 50
cooldown_secs = 30
max_wait_secs = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let av = &config.sources["alphavantage"];
        assert_eq!(av.requests_per_minute, 30);
        assert_eq!(av.cooldown_secs, 60);
        assert_eq!(av.max_wait_secs, 10); // default
        assert_eq!(config.sources["newswire"].max_wait_secs, 5);
    }

    #[test]
    fn test_retry_overrides() {
        let toml_str = r#"
[flow.retry]
max_attempts = 5
exponential = false
initial_backoff_ms = 100
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.flow.retry.max_attempts, 5);
        assert!(!config.flow.retry.exponential);
        assert_eq!(config.flow.retry.initial_backoff_ms, 100);
        assert_eq!(config.flow.retry.max_backoff_ms, 15_000);
    }
}
