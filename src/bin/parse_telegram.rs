use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use catalog_ingest::config;
use catalog_ingest::db;
use catalog_ingest::run::{self, RunOptions};
use catalog_ingest::telegram::{ChannelFetcher, FetchConfig, HttpChannelClient};

#[derive(Debug, Parser)]
#[command(author, version, about = "Pull the newest channel posts into the catalog")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Number of recent posts to process when no checkpoint exists yet
    #[arg(long, default_value_t = 50)]
    limit: usize,

    /// Override the configured channel username
    #[arg(long)]
    channel: Option<String>,

    /// Fetch and normalize without touching the database
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

    let channel = args.channel.as_deref().unwrap_or(&cfg.telegram.channel);
    let client = HttpChannelClient::new(&cfg.telegram.base_url)?;
    let fetcher = ChannelFetcher::new(
        &client,
        FetchConfig {
            pause: Duration::from_millis(cfg.app.request_pause_ms),
            max_retries: cfg.app.max_retries,
            retry_budget: Duration::from_secs(cfg.app.retry_budget_seconds),
        },
        channel,
        &cfg.app.data_dir,
    );

    let opts = RunOptions {
        batch_size: cfg.app.batch_size,
        dry_run: args.dry_run,
    };
    if args.dry_run {
        info!("dry run: no database changes will be made");
    }

    match run::run_telegram(&pool, &fetcher, args.limit, &opts, &cancel).await {
        Ok(summary) => {
            info!(
                channel,
                inserted = summary.inserted,
                updated = summary.updated,
                skipped = summary.skipped,
                failed = summary.failed,
                "telegram import finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(%err, channel, "telegram import failed");
            Err(err.into())
        }
    }
}
