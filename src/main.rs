mod embed;
mod sources;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stockflow_cache::{CacheManager, RateLimiter, TtlPolicy};
use stockflow_core::config::AppConfig;
use stockflow_core::context::{key, ns};
use stockflow_core::traits::ReportStore;
use stockflow_core::types::Severity;
use stockflow_core::{RunContext, SharedContext, StockflowError};
use stockflow_flow::{FlowEngine, RunOutcome, RunReport};
use stockflow_report::{
    comparison_flow, custom_research_flow, research_flow, validate_initial_context, Collaborators,
    FetchClient,
};
use stockflow_retrieval::{RelevanceScorer, SqliteStore};

use embed::HashEmbedder;
use sources::{FileSource, SyntheticSource};

#[derive(Parser)]
#[command(name = "stockflow", version, about = "Personal stock-research report generator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stockflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a research query (ticker, comparison, or free-form question)
    Run {
        #[arg(trailing_var_arg = true, required = true)]
        query: Vec<String>,
    },
    /// Compare two or more tickers side by side
    Compare {
        #[arg(required = true, num_args = 2..)]
        tickers: Vec<String>,
    },
    /// Answer a free-form research question from the document corpus
    Ask {
        #[arg(trailing_var_arg = true, required = true)]
        question: Vec<String>,
    },
    /// List saved reports
    Reports,
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stockflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = Arc::new(SqliteStore::open(&config.db_path())?);

    if let Commands::Reports = cli.command {
        let reports = store.list().await?;
        if reports.is_empty() {
            println!("no saved reports");
        }
        for report in reports {
            println!(
                "{}  {}  {}",
                report.id,
                report.created_at.to_rfc3339(),
                report.title
            );
        }
        return Ok(());
    }

    let deps = collaborators(&config, store);
    let engine = FlowEngine::new(config.flow.clone());

    let (flow, shared) = match &cli.command {
        Commands::Run { query } => {
            let query = query.join(" ");
            (research_flow(&deps)?, shared_for_query(&query))
        }
        Commands::Compare { tickers } => {
            let tickers: Vec<String> = tickers.iter().map(|t| t.to_uppercase()).collect();
            let query = format!("Compare {}", tickers.join(" and "));
            let mut shared = shared_for_query(&query);
            shared.set(key(ns::INPUT, "tickers"), serde_json::json!(tickers));
            (comparison_flow(&deps)?, shared)
        }
        Commands::Ask { question } => {
            let question = question.join(" ");
            (custom_research_flow(&deps)?, shared_for_query(&question))
        }
        Commands::Reports | Commands::Config => unreachable!(),
    };

    validate_initial_context(&shared)?;

    // Ctrl-C requests a graceful stop at the next step boundary.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            signal_token.cancel();
        }
    });

    let report = engine
        .run_with_cancel(&flow, RunContext::new(shared), cancel)
        .await?;
    render(&report);

    match report.outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Halted { step, severity } => {
            anyhow::bail!("run halted at step '{step}' ({severity})")
        }
        RunOutcome::Cancelled => anyhow::bail!("run cancelled"),
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<AppConfig> {
    match AppConfig::load(path) {
        Ok(config) => {
            info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        Err(StockflowError::ConfigNotFound(_)) => {
            info!(path = %path.display(), "no config file, using defaults");
            Ok(AppConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn collaborators(config: &AppConfig, store: Arc<SqliteStore>) -> Collaborators {
    let fetch = FetchClient::new(
        Arc::new(CacheManager::new(config.cache.capacity)),
        Arc::new(RateLimiter::new(&config.sources)),
        TtlPolicy::from_config(&config.cache),
        Arc::new(FileSource::new(config.data_dir())),
        Some(Arc::new(SyntheticSource)),
    );
    Collaborators {
        fetch: Arc::new(fetch),
        embedder: Arc::new(HashEmbedder),
        vectors: store.clone(),
        reports: store,
        scorer: RelevanceScorer::from_config(&config.retrieval),
    }
}

fn shared_for_query(query: &str) -> SharedContext {
    let mut shared = SharedContext::new();
    shared.set_str(key(ns::INPUT, "query"), query);
    shared
}

fn render(report: &RunReport) {
    if let Some(title) = report.context.shared.get_str(&key(ns::REPORT, "title")) {
        println!("\n{title}");
        println!("{}", "=".repeat(title.len()));
    }
    if let Some(sections) = report.context.shared.get(&key(ns::REPORT, "sections")) {
        match serde_json::to_string_pretty(sections) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => warn!(error = %e, "could not render sections"),
        }
    }

    for (section, status) in &report.sections {
        let severity = status
            .last_severity
            .map(|s| format!(" [{s}]"))
            .unwrap_or_default();
        println!("  {:?} {}{}", status.state, section, severity);
    }
    for failure in &report.failures {
        if failure.severity >= Severity::Error {
            eprintln!(
                "  {} at '{}': {}",
                failure.severity, failure.step, failure.message
            );
        }
    }
}
