use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use rampart_client::{ReqwestFetcher, source_host};
use rampart_core::{
    AppError, BatchCoordinator, BatchResult, BatchUnit, CircuitBreakerConfig, CircuitState,
    ResilienceConfig, ResilienceRegistry, RetryExecutor, SlotContext,
};
use rampart_core::traits::Fetcher;

#[derive(Parser)]
#[command(name = "rampart", version, about = "Resilient batch fetcher for remote data sources")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every source listed in a CSV file and save the bodies
    Fetch {
        /// CSV file with `id,url` columns
        #[arg(short, long)]
        sources: PathBuf,

        /// Directory the fetched bodies are written to
        #[arg(short, long, default_value = "out")]
        out_dir: PathBuf,

        /// Print the batch result as JSON instead of a summary
        #[arg(long, default_value_t = false)]
        json: bool,

        #[command(flatten)]
        resilience: ResilienceArgs,
    },

    /// Print the effective resilience configuration
    Config {
        #[command(flatten)]
        resilience: ResilienceArgs,
    },
}

/// Overrides for [`ResilienceConfig`]. Unset flags keep the value from the
/// environment (or the default).
#[derive(Args, Debug, Clone, Default)]
struct ResilienceArgs {
    /// Maximum concurrent fetches
    #[arg(long, env = "RAMPART_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Maximum queued fetches (0 = unlimited)
    #[arg(long, env = "RAMPART_QUEUE_LIMIT")]
    queue_limit: Option<usize>,

    /// How long a queued fetch waits for a slot
    #[arg(long, env = "RAMPART_ACQUIRE_TIMEOUT_MS")]
    acquire_timeout_ms: Option<u64>,

    /// Consecutive failures that open a host's circuit
    #[arg(long, env = "RAMPART_FAILURE_THRESHOLD")]
    failure_threshold: Option<u32>,

    /// How long an open circuit waits before probing
    #[arg(long, env = "RAMPART_RECOVERY_TIMEOUT_MS")]
    recovery_timeout_ms: Option<u64>,

    /// Attempts per source, including the first
    #[arg(long, env = "RAMPART_RETRY_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// First backoff delay
    #[arg(long, env = "RAMPART_RETRY_BASE_DELAY_MS")]
    base_delay_ms: Option<u64>,

    /// Backoff delay cap
    #[arg(long, env = "RAMPART_RETRY_MAX_DELAY_MS")]
    max_delay_ms: Option<u64>,

    /// Backoff growth factor
    #[arg(long, env = "RAMPART_RETRY_BACKOFF_MULTIPLIER")]
    backoff_multiplier: Option<f64>,
}

impl ResilienceArgs {
    fn resolve(&self) -> Result<ResilienceConfig, AppError> {
        let config = ResilienceConfig::from_env()?;
        self.apply(config)
    }

    fn apply(&self, mut config: ResilienceConfig) -> Result<ResilienceConfig, AppError> {
        if let Some(n) = self.max_concurrent {
            config.admission.max_concurrent = n;
        }
        if let Some(n) = self.queue_limit {
            config.admission.queue_limit = n;
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config.admission.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.failure_threshold {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(ms) = self.recovery_timeout_ms {
            config.circuit_breaker.recovery_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = self.base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = self.backoff_multiplier {
            config.retry.backoff_multiplier = m;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rampart=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            sources,
            out_dir,
            json,
            resilience,
        } => {
            let config = resilience
                .resolve()
                .context("Invalid resilience configuration")?;
            let result = cmd_fetch(&sources, &out_dir, &config).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            Ok(ExitCode::from(result.outcome.exit_code()))
        }
        Commands::Config { resilience } => {
            let config = resilience
                .resolve()
                .context("Invalid resilience configuration")?;
            println!("{config}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One row of the sources CSV.
#[derive(Debug, Clone, Deserialize)]
struct SourceRecord {
    id: String,
    url: String,
}

impl BatchUnit for SourceRecord {
    fn unit_id(&self) -> String {
        self.id.clone()
    }
}

/// Read and validate the sources CSV.
fn load_sources(path: &Path) -> Result<Vec<SourceRecord>, AppError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to open sources file {}: {e}",
            path.display()
        ))
    })?;

    let mut sources = Vec::new();
    let mut seen = HashSet::new();
    for record in reader.deserialize::<SourceRecord>() {
        let record = record.map_err(|e| {
            AppError::ConfigError(format!("Invalid row in {}: {e}", path.display()))
        })?;
        let id = record.id.trim();
        if id.is_empty() {
            return Err(AppError::ConfigError(format!(
                "Source with url '{}' has an empty id",
                record.url
            )));
        }
        if !seen.insert(id.to_string()) {
            return Err(AppError::ConfigError(format!("Duplicate source id '{id}'")));
        }
        sources.push(SourceRecord {
            id: id.to_string(),
            url: record.url.trim().to_string(),
        });
    }

    tracing::info!(count = sources.len(), path = %path.display(), "Loaded sources");
    Ok(sources)
}

/// 4xx responses say nothing about the host's health.
fn counts_against_host(error: &AppError) -> bool {
    !matches!(error, AppError::HttpStatus { status: 400..=499, .. })
}

async fn cmd_fetch(
    sources: &Path,
    out_dir: &Path,
    config: &ResilienceConfig,
) -> Result<BatchResult> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;

    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    let registry = ResilienceRegistry::new();
    let admission = registry.admission("fetch", config.admission.clone());
    let retry = RetryExecutor::new("fetch", config.retry.clone());
    let breaker_config = config
        .circuit_breaker
        .clone()
        .with_countable(counts_against_host);
    let coordinator = BatchCoordinator::new(admission);

    let result = coordinator
        .run_batch_from(async { load_sources(sources) }, |source: SourceRecord| {
            let fetcher = fetcher.clone();
            let retry = retry.clone();
            let registry = &registry;
            let breaker_config = &breaker_config;
            async move {
                fetch_source(&source, registry, &fetcher, &retry, breaker_config, out_dir).await
            }
        })
        .await;

    for stats in registry.list_all_stats() {
        if stats.state != CircuitState::Closed {
            tracing::warn!(
                circuit = %stats.name,
                state = %stats.state,
                failures = stats.total_failures,
                "Host circuit not closed after batch"
            );
        }
    }

    Ok(result)
}

/// Fetch one source through retry and its host's circuit breaker, then
/// write the body to `out_dir`.
async fn fetch_source<F: Fetcher>(
    source: &SourceRecord,
    registry: &ResilienceRegistry,
    fetcher: &F,
    retry: &RetryExecutor,
    breaker_config: &CircuitBreakerConfig,
    out_dir: &Path,
) -> Result<PathBuf, AppError> {
    let host = source_host(&source.url)?;
    let breaker = registry.circuit_breaker(&host, breaker_config.clone());
    let context = SlotContext::from([
        ("source".to_string(), source.id.clone()),
        ("url".to_string(), source.url.clone()),
    ]);

    let body = retry
        .execute_with_retry(|| breaker.execute_with_context(&context, || fetcher.fetch(&source.url)))
        .await
        .into_result()?;

    let path = out_dir.join(output_file_name(&source.id));
    tokio::fs::write(&path, &body).await?;
    tracing::info!(
        source = %source.id,
        bytes = body.len(),
        path = %path.display(),
        "Saved source"
    );
    Ok(path)
}

/// File name for a source id, with anything outside `[A-Za-z0-9._-]` replaced.
fn output_file_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_start_matches('.');
    if safe.is_empty() {
        "source.body".to_string()
    } else {
        format!("{safe}.body")
    }
}

fn print_summary(result: &BatchResult) {
    println!(
        "Batch {}: {} ({}/{} succeeded in {}ms)",
        result.batch_id,
        result.outcome,
        result.succeeded.len(),
        result.processed.len(),
        result.duration_ms
    );

    if let Some(error) = &result.fatal_error {
        println!("  aborted: {error}");
    }

    for failure in &result.failures {
        println!(
            "  [FAILED] {} at {}",
            failure.error,
            failure.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}
