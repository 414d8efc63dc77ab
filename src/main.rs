use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use depot_sync::app::Depot;
use depot_sync::config;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let depot = Depot::open(&cfg).await?;
    let pending = depot.store.count().await?;
    info!(pending, base_url = %cfg.remote.base_url, "starting depot sync");

    // Probe and coordinator run until shutdown.
    let (probe, sync) = depot.spawn_background();

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    probe.abort();
    sync.abort();

    let pending = depot.store.count().await?;
    info!(pending, "depot sync stopped");
    Ok(())
}
