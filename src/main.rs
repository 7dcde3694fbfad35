use std::{path::PathBuf, process::ExitCode, sync::Arc};

use barrage::{
    AbortSignal, Executor, IterationContext, RampingArrivalRate, RunMetrics, Scenario,
    config::{Overrides, RunConfig},
    data::TestData,
    error::{ConfigError, ReportError},
    report::{JsonReporter, Reporter, StdoutReporter, Summary},
    request::RequestBuilder,
    signer::HmacSha256Signer,
    threshold,
    transport::HttpTransport,
    worker::Worker,
};
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt};

const CONFIG_ERROR_EXIT_CODE: u8 = 2;
const FATAL_EXIT_CODE: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "barrage")]
#[command(about = "Arrival-rate load generator for the signed init endpoint", long_about = None)]
#[command(version)]
struct Cli {
    /// Run configuration (TOML)
    #[arg(short, long, env = "BARRAGE_CONFIG")]
    config: PathBuf,

    /// HMAC-SHA256 signing key, overrides `signing.secret_key`
    #[arg(long, env = "BARRAGE_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Base URL of the target, overrides `target.base_url`
    #[arg(long, env = "BARRAGE_BASE_URL")]
    base_url: Option<String>,

    /// Also write the summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(summary) => ExitCode::from(summary.exit_code()),
        Err(RunError::Config(e)) => {
            tracing::error!("Configuration error: {e}");
            ExitCode::from(CONFIG_ERROR_EXIT_CODE)
        }
        Err(RunError::Report(e)) => {
            tracing::error!("{e}");
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

async fn run(cli: Cli) -> Result<Summary, RunError> {
    let overrides = Overrides {
        secret_key: cli.secret_key,
        base_url: cli.base_url,
    };
    let config = RunConfig::load(&cli.config, &overrides)?;

    let signer = HmacSha256Signer::new(config.secret_key.as_bytes())?;
    let data = TestData::from_csv_path(&config.data_path)?;
    let transport = HttpTransport::new(config.endpoint.clone(), config.timeout)?;
    tracing::info!("Target: POST {}", transport.endpoint());

    // Built once and shared; the action only clones handles.
    let worker = Worker::builder()
        .requests(RequestBuilder::new(
            Arc::new(signer),
            config.amount,
            config.lang.as_str(),
        ))
        .data(Arc::new(data))
        .transport(Arc::new(transport))
        .checks(config.checks)
        .build();

    let metrics = Arc::new(RunMetrics::new());
    let scenario = Scenario::builder()
        .name(config.scenario_name.as_str())
        .action(move |ctx: IterationContext| {
            let worker = worker.clone();
            async move { worker.run(ctx).await }
        })
        .metrics(Arc::clone(&metrics))
        .build();
    let executor = RampingArrivalRate::builder()
        .schedule(config.schedule.clone())
        .grace_period(config.grace_period)
        .build();

    let (abort, handle) = AbortSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl-C, stopping dispatch...");
            handle.abort();
        }
    });

    let stats = executor.exec(&scenario, abort).await?;

    let snapshot = metrics.snapshot(stats.elapsed);
    let evaluation = threshold::evaluate(&config.thresholds, &snapshot);
    let summary = Summary::new(
        &config.scenario_name,
        &stats,
        &snapshot,
        evaluation,
        &config.trend_stats,
    );

    StdoutReporter.report(&summary).await?;
    if let Some(path) = cli.summary_json {
        JsonReporter::new(path).report(&summary).await?;
    }
    Ok(summary)
}
