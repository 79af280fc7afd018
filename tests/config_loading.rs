//! Config loading from TOML files, defaults, and env expansion.

use std::io::Write;

use stockflow_core::config::AppConfig;
use stockflow_core::StockflowError;

#[test]
fn test_partial_config_fills_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[flow]
batch_concurrency = 8

[cache]
intraday_ttl_secs = 300

[sources.alphavantage]
requests_per_minute = 30

[sources.newswire]
requests_per_minute = 50
cooldown_secs = 30
"#
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.flow.batch_concurrency, 8);
    // Untouched fields keep their defaults.
    assert_eq!(config.flow.max_step_visits, 5);
    assert_eq!(config.flow.retry.max_attempts, 3);
    assert_eq!(config.cache.intraday_ttl_secs, 300);
    assert_eq!(config.cache.statements_ttl_secs, 86_400);
    assert_eq!(config.retrieval.semantic_weight, 0.6);

    assert_eq!(config.sources["alphavantage"].requests_per_minute, 30);
    assert_eq!(config.sources["alphavantage"].cooldown_secs, 60);
    assert_eq!(config.sources["newswire"].cooldown_secs, 30);
}

#[test]
fn test_env_vars_expand_in_paths() {
    std::env::set_var("STOCKFLOW_TEST_DB_DIR", "/tmp/stockflow-test");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[storage]
db_path = "${{STOCKFLOW_TEST_DB_DIR}}/reports.db"
"#
    )
    .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.storage.db_path, "/tmp/stockflow-test/reports.db");
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/stockflow.toml")).unwrap_err();
    assert!(matches!(err, StockflowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[flow\nbatch_concurrency = 8").unwrap();
    let err = AppConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, StockflowError::Config(_)));
}
