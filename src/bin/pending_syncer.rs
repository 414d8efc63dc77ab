use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use depot_sync::app::Depot;
use depot_sync::config;
use depot_sync::retry::RetryPolicy;
use depot_sync::sync::DrainOutcome;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Push all pending records to the remote store and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Drain passes to run while records keep failing
    #[arg(long, default_value = "3")]
    passes: u32,

    /// Exit with an error if records remain after the last pass
    #[arg(long)]
    strict: bool,
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

    let stats = depot.store.stats().await?;
    info!(
        pending = stats.pending,
        max_attempt = stats.max_attempt,
        oldest = ?stats.oldest,
        "Initial queue state"
    );
    if stats.pending == 0 {
        info!("No pending records, exiting");
        return Ok(());
    }

    if let Err(err) = depot.remote.ping().await {
        warn!(%err, "remote store not reachable; attempting drain anyway");
    }

    let passes = args.passes.max(1);
    let policy = cfg.retry_policy();
    let mut applied = 0;
    for pass in 1..=passes {
        match depot.coordinator.drain().await? {
            DrainOutcome::Completed(report) => {
                applied += report.applied;
                info!(pass, applied = report.applied, failed = report.failed, "Drain pass finished");
                if report.failed == 0 {
                    break;
                }
            }
            DrainOutcome::Skipped => warn!(pass, "drain already running"),
        }
        if let Some(delay) = pause_after(&policy, pass, passes) {
            tokio::time::sleep(delay).await;
        }
    }

    let stats = depot.store.stats().await?;
    if stats.pending > 0 {
        error!(
            remaining = stats.pending,
            max_attempt = stats.max_attempt,
            "Records remain queued"
        );
        if args.strict {
            bail!("{} pending records could not be synced", stats.pending);
        }
    } else {
        info!(total_applied = applied, "All pending records synced");
    }
    Ok(())
}

/// Backoff before the next pass; none after the last one.
fn pause_after(policy: &RetryPolicy, pass: u32, passes: u32) -> Option<Duration> {
    (pass < passes).then(|| policy.delay_for_attempt(pass))
}
