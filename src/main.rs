use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scavenger_miner::api::ApiClient;
use scavenger_miner::challenge::ChallengeCache;
use scavenger_miner::config::Config;
use scavenger_miner::miner::MinerManager;
use scavenger_miner::solutions::SolutionStore;
use scavenger_miner::stats::SessionStats;
use scavenger_miner::wallet::{DevFeeManager, WalletPool};

#[derive(Parser)]
#[command(name = "scavenger-miner")]
#[command(about = "Multi-device proof-of-work client for the Scavenger challenge protocol", version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Enable CPU mining
    #[arg(long)]
    cpu: bool,

    /// Number of CPU workers
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if cli.cpu {
        config.cpu.enabled = true;
    }
    if let Some(workers) = cli.workers {
        config.cpu.enabled = true;
        config.cpu.workers = workers.clamp(1, num_cpus::get());
    }

    let default_filter = if config.miner.verbose {
        "scavenger_miner=debug"
    } else {
        "scavenger_miner=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Scavenger Miner starting ===");
    info!("API base: {}", config.miner.api_url);

    let api = Arc::new(ApiClient::new(config.miner.api_url.clone())?);
    let dev_fee = DevFeeManager::new()?;
    let pool = Arc::new(WalletPool::new(
        ".",
        api.clone(),
        config.wallet.consolidate_address.clone(),
        dev_fee.dev_consolidate_address().to_string(),
    ));
    let cache = Arc::new(ChallengeCache::new("."));
    let store = Arc::new(SolutionStore::new("."));
    let stats = Arc::new(SessionStats::new());

    let mut manager = MinerManager::new(config, api, pool, cache, store, stats, dev_fee);
    let shutdown = manager.shutdown_flag();

    let mut run_task = tokio::spawn(async move { manager.run().await });

    tokio::select! {
        result = &mut run_task => {
            let result = result?;
            if let Err(e) = &result {
                error!("Miner manager exited with error: {e:#}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested by user");
            shutdown.store(true, Ordering::Relaxed);
            // Let the manager drain its workers before exiting.
            run_task.await??;
            Ok(())
        }
    }
}
