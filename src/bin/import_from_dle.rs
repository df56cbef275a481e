use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use catalog_ingest::config;
use catalog_ingest::db;
use catalog_ingest::run::{self, RunOptions};

#[derive(Debug, Parser)]
#[command(author, version, about = "Import articles from a legacy DLE SQL dump")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the SQL dump (defaults to legacy.sql_file from config)
    #[arg(long)]
    sql_file: Option<PathBuf>,

    /// Wipe previously imported legacy posts before reloading
    #[arg(long)]
    clear: bool,

    /// Scan and normalize without touching the database
    #[arg(long)]
    dry_run: bool,
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/catalog.db?mode=rwc", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current batch");
            cancel_flag.store(true, Ordering::Relaxed);
        }
    });

    let dump_path = args
        .sql_file
        .unwrap_or_else(|| PathBuf::from(&cfg.legacy.sql_file));
    let opts = RunOptions {
        batch_size: cfg.app.batch_size,
        dry_run: args.dry_run,
    };
    if args.dry_run {
        info!("dry run: no database changes will be made");
    }

    match run::run_dle(&pool, &dump_path, args.clear, &opts, &cancel).await {
        Ok(summary) => {
            info!(
                dump = %dump_path.display(),
                inserted = summary.inserted,
                updated = summary.updated,
                skipped = summary.skipped,
                failed = summary.failed,
                "legacy import finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(%err, dump = %dump_path.display(), "legacy import failed");
            Err(err.into())
        }
    }
}
