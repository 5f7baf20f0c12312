use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use shuttle_core::{Scheduler, SchedulerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod demos;

#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(about = "Cooperative task scheduler demos")]
#[command(version)]
struct Cli {
    /// Number of worker slots (overrides the config file).
    #[arg(long, global = true)]
    pool_size: Option<usize>,

    /// Scheduler config as JSON, e.g. {"pool_size": 4}.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add two numbers after a simulated delay.
    Sum {
        #[arg(long, default_value_t = 1)]
        a: i64,
        #[arg(long, default_value_t = 1)]
        b: i64,
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
    },
    /// Process numbers one per step until done or the timeout fires.
    Numbers {
        #[arg(long, default_value_t = 10)]
        count: u32,
        #[arg(long, default_value_t = 1000)]
        step_ms: u64,
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
    },
    /// Fetch simulated pages one after another or all at once.
    Pages {
        #[arg(long, value_enum, default_value_t = FetchMode::Parallel)]
        mode: FetchMode,
        #[arg(long, default_value_t = 3)]
        pages: u32,
        #[arg(long, default_value_t = 300)]
        latency_ms: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FetchMode {
    Sequential,
    Parallel,
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            SchedulerConfig::from_json_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let scheduler = Scheduler::new(config).context("building scheduler")?;
    info!(pool_size = scheduler.pool_size(), "scheduler ready");

    let scheduling = scheduler.start();

    let outcome = match cli.command {
        Command::Sum { a, b, delay_ms } => demos::sum(&scheduler, a, b, delay_ms).await,
        Command::Numbers {
            count,
            step_ms,
            timeout_ms,
        } => demos::numbers(&scheduler, count, step_ms, timeout_ms).await,
        Command::Pages {
            mode,
            pages,
            latency_ms,
        } => demos::pages(&scheduler, mode, pages, latency_ms).await,
    };

    scheduler.shutdown().await;
    let summary = scheduling.await.context("scheduling loop panicked")??;
    info!(
        steps = summary.steps_dispatched,
        completed = summary.counts.completed,
        failed = summary.counts.failed,
        cancelled = summary.counts.cancelled,
        peak_running = summary.counts.peak_running,
        "scheduler stopped"
    );

    for (handle, error) in scheduler.unobserved_failures().await {
        info!(%handle, %error, "unobserved failure");
    }

    outcome
}
