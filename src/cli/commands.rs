//! CLI command definitions for orderflow.
//!
//! Runs the bundled demo scenarios through the pipeline and prints the
//! resulting report.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{Pipeline, PipelineConfig, PipelineReport};
use crate::simulation::orders::{order_config, sample_orders, ORDER_TIMINGS};
use crate::simulation::plan::{scale_duration, SimTimings};
use crate::simulation::uploads::{sample_uploads, upload_config, UPLOAD_TIMINGS};

/// Bounded async work pipeline demo.
#[derive(Parser, Debug)]
#[command(name = "orderflow")]
#[command(about = "Run work items through a bounded, retrying async pipeline")]
#[command(version)]
#[command(
    long_about = "orderflow pushes work items through a bounded queue into a fixed pool of workers.\n\nEach item is validated, sent to a rate-limited external call with timeout and retry,\npassed through a blocking step and finalized.\n\nExample usage:\n  orderflow run --scenario orders --time-scale 0.1\n  orderflow run --scenario uploads --workers 2 --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a demo scenario through the pipeline.
    Run(RunArgs),

    /// Print the effective configuration as YAML.
    Config(ConfigArgs),
}

/// Demo scenarios bundled with the binary.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Order scoring, saving and confirmation.
    Orders,
    /// Image scanning, thumbnailing and upload.
    Uploads,
}

impl Scenario {
    fn default_config(self) -> PipelineConfig {
        match self {
            Scenario::Orders => order_config(),
            Scenario::Uploads => upload_config(),
        }
    }

    fn timings(self) -> SimTimings {
        match self {
            Scenario::Orders => ORDER_TIMINGS,
            Scenario::Uploads => UPLOAD_TIMINGS,
        }
    }
}

/// Pipeline settings shared by `run` and `config`.
///
/// Precedence: flags > `PIPELINE_*` environment variables > `--config` file
/// (or the scenario defaults when no file is given).
#[derive(clap::Args, Debug, Clone)]
pub struct ConfigOverrides {
    /// Scenario whose defaults and sample items are used.
    #[arg(short, long, value_enum, default_value = "orders")]
    pub scenario: Scenario,

    /// YAML configuration file; replaces the scenario defaults.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Number of workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Queue capacity (0 = unbounded).
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Maximum external calls in flight.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-attempt call timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Retries after the first attempt.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Wait between attempts in milliseconds.
    #[arg(long)]
    pub backoff_ms: Option<u64>,

    /// Wait before each admission in milliseconds.
    #[arg(long)]
    pub ingest_interval_ms: Option<u64>,

    /// Log progress every N milliseconds.
    #[arg(long)]
    pub progress_interval_ms: Option<u64>,

    /// Multiplier for simulated latencies and the scenario's default timings.
    #[arg(short = 't', long, default_value = "1.0")]
    pub time_scale: f64,
}

/// Arguments for `orderflow run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub settings: ConfigOverrides,

    /// Print the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `orderflow config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub settings: ConfigOverrides,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Config(args) => run_config_command(args),
    }
}

// ============================================================================
// Configuration layering
// ============================================================================

fn scale_default(duration: Duration, factor: f64) -> anyhow::Result<Duration> {
    scale_duration(duration, factor)
        .ok_or_else(|| anyhow::anyhow!("--time-scale {} overflows {:?}", factor, duration))
}

/// Builds the effective configuration for `settings`.
pub fn resolve_config(settings: &ConfigOverrides) -> anyhow::Result<PipelineConfig> {
    let scale = settings.time_scale;
    if !scale.is_finite() || scale < 0.0 {
        anyhow::bail!("--time-scale must be a non-negative number");
    }
    if settings.scenario.timings().checked_scaled(scale).is_none() {
        anyhow::bail!("--time-scale {} is too large for the simulated latencies", scale);
    }

    let base = match &settings.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => {
            let defaults = settings.scenario.default_config();
            let call_timeout =
                scale_default(defaults.call_timeout, scale)?.max(Duration::from_millis(1));
            let retry_backoff = scale_default(defaults.retry_backoff, scale)?;
            let ingest_interval = scale_default(defaults.ingest_interval, scale)?;
            defaults
                .with_call_timeout(call_timeout)
                .with_retry_backoff(retry_backoff)
                .with_ingest_interval(ingest_interval)
        }
    };

    let mut config = base.with_env_overrides()?;
    if let Some(workers) = settings.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(capacity) = settings.queue_capacity {
        config = config.with_queue_capacity(capacity);
    }
    if let Some(limit) = settings.concurrency {
        config = config.with_call_concurrency(limit);
    }
    if let Some(ms) = settings.timeout_ms {
        config = config.with_call_timeout(Duration::from_millis(ms));
    }
    if let Some(retries) = settings.max_retries {
        config = config.with_max_retries(retries);
    }
    if let Some(ms) = settings.backoff_ms {
        config = config.with_retry_backoff(Duration::from_millis(ms));
    }
    if let Some(ms) = settings.ingest_interval_ms {
        config = config.with_ingest_interval(Duration::from_millis(ms));
    }
    if let Some(ms) = settings.progress_interval_ms {
        config = config.with_progress_interval(Some(Duration::from_millis(ms)));
    }

    config.validate()?;
    Ok(config)
}

// ============================================================================
// Command Implementation
// ============================================================================

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args.settings)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args.settings)?;
    let scale = args.settings.time_scale;

    if args.metrics {
        if let Err(e) = init_metrics() {
            warn!(error = %e, "Failed to initialize metrics");
        }
    }

    info!(scenario = ?args.settings.scenario, time_scale = scale, "Running scenario");

    let report = match args.settings.scenario {
        Scenario::Orders => {
            let (handler, items) =
                sample_orders(Scenario::Orders.timings().scaled(scale), config.call_timeout);
            Pipeline::new(config, Arc::new(handler))
                .run_items(items)
                .await?
        }
        Scenario::Uploads => {
            let (handler, items) =
                sample_uploads(Scenario::Uploads.timings().scaled(scale), config.call_timeout);
            Pipeline::new(config, Arc::new(handler))
                .run_items(items)
                .await?
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    if args.metrics {
        println!("{}", export_metrics());
    }

    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!("\n=== Pipeline Results ===");
    println!("Run id:         {}", report.run_id);
    println!("Duration:       {:.2}s", report.duration_secs());
    println!("Items admitted: {}", report.items_admitted);
    println!("Success:        {}", report.stats.success);
    println!("Invalid:        {}", report.stats.invalid);
    println!("Failed:         {}", report.stats.failed);
    println!("Peak in flight: {}", report.peak_calls_in_flight);
    println!();
    for worker in &report.workers {
        println!(
            "  {:<10} processed {:>3}  (success {}, invalid {}, failed {})",
            worker.worker,
            worker.items_processed,
            worker.outcomes.success,
            worker.outcomes.invalid,
            worker.outcomes.failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn settings(cli: Cli) -> ConfigOverrides {
        match cli.command {
            Commands::Run(args) => args.settings,
            Commands::Config(args) => args.settings,
        }
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = parse(&[
            "orderflow",
            "run",
            "--scenario",
            "uploads",
            "--workers",
            "5",
            "--timeout-ms",
            "250",
            "--json",
        ]);
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert!(args.json);
                assert!(!args.metrics);
                assert_eq!(args.settings.scenario, Scenario::Uploads);
                assert_eq!(args.settings.workers, Some(5));
                assert_eq!(args.settings.timeout_ms, Some(250));
            }
            Commands::Config(_) => panic!("expected run command"),
        }
    }

    #[test]
    fn test_flags_override_scenario_defaults() {
        let cli = parse(&[
            "orderflow",
            "config",
            "--scenario",
            "uploads",
            "--concurrency",
            "1",
            "--backoff-ms",
            "20",
            "--progress-interval-ms",
            "500",
        ]);
        let config = resolve_config(&settings(cli)).unwrap();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert_eq!(config.call_concurrency, 1);
        assert_eq!(config.retry_backoff, Duration::from_millis(20));
        assert_eq!(config.progress_interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_time_scale_shrinks_default_timings() {
        let cli = parse(&["orderflow", "config", "--time-scale", "0.5"]);
        let config = resolve_config(&settings(cli)).unwrap();
        assert_eq!(config.call_timeout, Duration::from_secs(2));
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.ingest_interval, Duration::from_millis(600));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let cli = parse(&["orderflow", "run", "--workers", "0"]);
        assert!(resolve_config(&settings(cli)).is_err());

        let cli = parse(&["orderflow", "run", "--time-scale=-2"]);
        assert!(resolve_config(&settings(cli)).is_err());
    }

    #[test]
    fn test_overflowing_time_scale_rejected() {
        let cli = parse(&["orderflow", "run", "--time-scale", "1e20"]);
        let err = resolve_config(&settings(cli)).unwrap_err();
        assert!(err.to_string().contains("too large"));

        let cli = parse(&["orderflow", "config", "--scenario", "uploads", "--time-scale", "1e20"]);
        assert!(resolve_config(&settings(cli)).is_err());

        let cli = parse(&["orderflow", "config", "--time-scale", "1000"]);
        let config = resolve_config(&settings(cli)).unwrap();
        assert_eq!(config.call_timeout, Duration::from_secs(4000));
    }

    #[test]
    fn test_config_file_replaces_scenario_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"worker_count: 7\ncall_timeout_ms: 150\n").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cli = parse(&["orderflow", "config", "--config", &path, "--max-retries", "0"]);
        let config = resolve_config(&settings(cli)).unwrap();
        assert_eq!(config.worker_count, 7);
        assert_eq!(config.call_timeout, Duration::from_millis(150));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.ingest_interval, Duration::ZERO);
    }
}
