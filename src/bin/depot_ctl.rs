use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use depot_sync::app::Depot;
use depot_sync::config;
use depot_sync::distribution::NewBucket;
use depot_sync::model::{BucketKind, RepairLogEntry, ScanCategory, Session};

#[derive(Debug, Parser)]
#[command(author, version, about = "Operator commands for the depot inventory")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Actor recorded in the activity log
    #[arg(long, env = "DEPOT_ACTOR", default_value = "operator")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Category {
    Vehicle,
    Battery,
    SparePart,
}

impl From<Category> for ScanCategory {
    fn from(c: Category) -> Self {
        match c {
            Category::Vehicle => ScanCategory::Vehicle,
            Category::Battery => ScanCategory::Battery,
            Category::SparePart => ScanCategory::SparePart,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Pallet,
    Cell,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Commit a scan session (queued locally if the remote is unreachable)
    Commit {
        #[arg(long, value_enum)]
        category: Category,
        #[arg(long)]
        note: Option<String>,
        #[arg(required = true)]
        codes: Vec<String>,
    },
    /// Commit a repair log entry
    Repair {
        item_code: String,
        description: String,
        #[arg(long = "part")]
        parts: Vec<String>,
    },
    /// Show the local pending queue
    Pending,
    CreateBucket {
        #[arg(long, value_enum)]
        kind: Kind,
        #[arg(long)]
        number: i64,
        #[arg(long)]
        manufacturer: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    Distribute {
        bucket_id: String,
        #[arg(required = true)]
        codes: Vec<String>,
    },
    RemoveItem {
        bucket_id: String,
        code: String,
    },
    RestoreItem {
        bucket_id: String,
        code: String,
    },
    DeleteBucket {
        bucket_id: String,
    },
    /// Print recent activity, newest first
    Activity {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    ClearActivity,
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
    let actor = args.actor.as_str();

    match args.command {
        Command::Commit {
            category,
            note,
            codes,
        } => {
            let session = Session {
                codes,
                category: category.into(),
                created_by: actor.to_string(),
                created_at: Utc::now(),
                note,
            };
            let outcome = depot.gateway.commit_session(&session).await?;
            println!("{outcome:?}");
        }
        Command::Repair {
            item_code,
            description,
            parts,
        } => {
            let entry = RepairLogEntry {
                item_code,
                technician: actor.to_string(),
                description,
                parts_used: parts,
                created_at: Utc::now(),
            };
            let outcome = depot.gateway.commit_repair_log(&entry).await?;
            println!("{outcome:?}");
        }
        Command::Pending => {
            let stats = depot.store.stats().await?;
            println!(
                "pending={} max_attempt={} oldest={:?}",
                stats.pending, stats.max_attempt, stats.oldest
            );
            for rec in depot.store.list_all().await? {
                println!(
                    "{}\t{}\t{}\tattempt={}\t{}",
                    rec.local_id,
                    rec.kind.as_str(),
                    rec.remote_id,
                    rec.attempt,
                    rec.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::CreateBucket {
            kind,
            number,
            manufacturer,
            id,
        } => {
            let kind = match kind {
                Kind::Pallet => BucketKind::Pallet,
                Kind::Cell => BucketKind::Cell,
            };
            let bucket = depot
                .engine
                .create_bucket(
                    NewBucket {
                        id,
                        kind,
                        display_number: number,
                        manufacturer_tag: manufacturer,
                    },
                    actor,
                )
                .await?;
            println!("{}", bucket.id);
        }
        Command::Distribute { bucket_id, codes } => {
            let result = depot.engine.distribute(&bucket_id, &codes, actor).await?;
            println!(
                "added={} duplicates={}",
                result.added_count, result.duplicate_count
            );
        }
        Command::RemoveItem { bucket_id, code } => {
            let changed = depot.engine.remove_item(&bucket_id, &code, actor).await?;
            println!("changed={changed}");
        }
        Command::RestoreItem { bucket_id, code } => {
            let changed = depot.engine.restore_item(&bucket_id, &code, actor).await?;
            println!("changed={changed}");
        }
        Command::DeleteBucket { bucket_id } => {
            let released = depot.engine.delete_bucket(&bucket_id, actor).await?;
            println!("released={released}");
        }
        Command::Activity { limit } => {
            for entry in depot.activity.recent(limit).await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::ClearActivity => {
            let removed = depot.activity.clear(actor).await?;
            println!("removed={removed}");
        }
    }
    info!(actor, "command finished");
    Ok(())
}
