use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use testmux::config::{BackoffConfig, OrchestratorConfig, StoreConfig};
use testmux::orchestrator::Orchestrator;
use testmux::shutdown::install_shutdown_handler;
use testmux::store;

#[derive(Parser, Debug)]
#[command(name = "testmux")]
#[command(version)]
#[command(about = "Test-job orchestrator that batches jobs by app build and dispatches them to device workers")]
struct Args {
    /// Redis URL for the persistent store (e.g. "redis://127.0.0.1:6379/0").
    /// If unset or unreachable at startup, runs on the in-memory store.
    #[arg(long, env = "TESTMUX_REDIS_URL")]
    redis_url: Option<String>,

    /// Scheduling tick interval in seconds
    #[arg(long, default_value = "5")]
    schedule_interval: u64,

    /// Heartbeat silence (seconds) before a worker is marked stale
    #[arg(long, default_value = "120")]
    worker_stale_after: u64,

    /// Heartbeat silence (seconds) before a worker is marked offline and its
    /// work reclaimed
    #[arg(long, default_value = "300")]
    worker_offline_after: u64,

    /// Wall-clock limit (seconds) for a single running job
    #[arg(long, default_value = "1800")]
    job_timeout: u64,

    /// Default number of retries granted to each job
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Base delay (seconds) of the retry backoff
    #[arg(long, default_value = "10")]
    backoff_base: u64,

    /// Cap (seconds) on the retry backoff
    #[arg(long, default_value = "300")]
    backoff_max: u64,

    /// Disable backoff jitter (useful for reproducible runs)
    #[arg(long)]
    no_jitter: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = OrchestratorConfig {
        schedule_interval: Duration::from_secs(args.schedule_interval),
        retry_sweep_interval: Duration::from_secs(args.schedule_interval),
        health_sweep_interval: Duration::from_secs(args.schedule_interval.max(10)),
        worker_stale_after: Duration::from_secs(args.worker_stale_after),
        worker_offline_after: Duration::from_secs(args.worker_offline_after),
        job_timeout: Duration::from_secs(args.job_timeout),
        default_max_retries: args.max_retries,
        backoff: BackoffConfig {
            base: Duration::from_secs(args.backoff_base),
            max: Duration::from_secs(args.backoff_max),
            jitter: !args.no_jitter,
        },
        store: StoreConfig {
            redis_url: args.redis_url,
        },
    };

    let store = store::select_backend(&config.store).await;
    tracing::info!(backend = store.backend_name(), "Storage backend selected");

    let orchestrator = Arc::new(Orchestrator::new(store, config));
    let token = install_shutdown_handler();
    orchestrator.clone().spawn_background_loops(token.clone());
    tracing::info!("Orchestrator running");

    token.cancelled().await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}
