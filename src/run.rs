//! Orchestrator: wires one source adapter through the normalizer and the
//! dedup/upsert engine for a single CLI invocation.
//!
//! Per-record failures are counted and never abort a run; adapter-level and
//! batch-level failures do. Cancellation is checked between records and
//! before each batch write, never mid-transaction.

use crate::db::{self, Pool};
use crate::dle;
use crate::engine;
use crate::error::PipelineError;
use crate::model::{Outcome, Post, RawRecord, RunSummary, Source};
use crate::normalize;
use crate::telegram::{ChannelClient, ChannelFetcher};
use chrono::Utc;
use futures::{pin_mut, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Crashed runs stop blocking the source after this long.
const LEASE_TTL_SECONDS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    /// Fetch and normalize, but write nothing.
    pub dry_run: bool,
}

/// Incremental Telegram pull: newest messages first, resuming from the
/// stored checkpoint when one exists, otherwise capped at `limit`.
pub async fn run_telegram<C: ChannelClient>(
    pool: &Pool,
    fetcher: &ChannelFetcher<'_, C>,
    limit: usize,
    opts: &RunOptions,
    cancel: &AtomicBool,
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::new(Source::Telegram);
    let holder = summary.run_id.to_string();

    if !opts.dry_run {
        db::acquire_lease(pool, Source::Telegram, &holder, LEASE_TTL_SECONDS).await?;
    }
    let result = drive_telegram(pool, fetcher, limit, opts, cancel, &mut summary).await;
    if !opts.dry_run {
        if let Err(err) = db::release_lease(pool, Source::Telegram, &holder).await {
            warn!(%err, "failed to release telegram run lease");
        }
    }
    result.map(|()| summary)
}

async fn drive_telegram<C: ChannelClient>(
    pool: &Pool,
    fetcher: &ChannelFetcher<'_, C>,
    limit: usize,
    opts: &RunOptions,
    cancel: &AtomicBool,
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    let since = db::get_checkpoint(pool, Source::Telegram)
        .await?
        .map(|cp| cp.last_external_id)
        .filter(|id| *id > 0);
    info!(limit, ?since, "starting telegram pull");

    let stream = fetcher.stream(limit, since);
    pin_mut!(stream);

    let mut batch: Vec<Post> = Vec::with_capacity(opts.batch_size);
    while let Some(item) = stream.next().await {
        if cancel.load(Ordering::Relaxed) {
            warn!(buffered = batch.len(), "cancelled; dropping unwritten records");
            batch.clear();
            break;
        }

        match item {
            Ok(raw) => {
                let record = RawRecord::Telegram(raw);
                match normalize::normalize(&record) {
                    Ok(post) => batch.push(post),
                    Err(err) => {
                        summary.failed += 1;
                        warn!(%err, external_id = %record.external_id(), "record not normalized");
                    }
                }
            }
            Err(err) if err.is_per_record() => {
                summary.failed += 1;
                warn!(%err, "record failed");
            }
            Err(err) => return Err(err),
        }

        if batch.len() >= opts.batch_size {
            flush(pool, &mut batch, opts, true, summary, cancel).await?;
        }
    }

    flush(pool, &mut batch, opts, true, summary, cancel).await?;
    Ok(())
}

/// Legacy dump import. `clear` wipes the source's posts (and orphaned
/// categories/tags) first, making every subsequent apply an insert.
pub async fn run_dle(
    pool: &Pool,
    dump_path: &Path,
    clear: bool,
    opts: &RunOptions,
    cancel: &AtomicBool,
) -> Result<RunSummary, PipelineError> {
    let mut summary = RunSummary::new(Source::LegacyCms);
    let holder = summary.run_id.to_string();

    if !opts.dry_run {
        db::acquire_lease(pool, Source::LegacyCms, &holder, LEASE_TTL_SECONDS).await?;
    }
    let result = drive_dle(pool, dump_path, clear, opts, cancel, &mut summary).await;
    if !opts.dry_run {
        if let Err(err) = db::release_lease(pool, Source::LegacyCms, &holder).await {
            warn!(%err, "failed to release legacy run lease");
        }
    }
    result.map(|()| summary)
}

async fn drive_dle(
    pool: &Pool,
    dump_path: &Path,
    clear: bool,
    opts: &RunOptions,
    cancel: &AtomicBool,
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    if clear && !opts.dry_run {
        let removed = db::clear_source(pool, Source::LegacyCms).await?;
        info!(removed, "cleared legacy posts before reload");
    }

    let mut scan = dle::scan(dump_path)?;
    info!(dump = %dump_path.display(), clear, "starting legacy import");

    let mut batch: Vec<Post> = Vec::with_capacity(opts.batch_size);
    for item in scan.by_ref() {
        if cancel.load(Ordering::Relaxed) {
            warn!(buffered = batch.len(), "cancelled; dropping unwritten records");
            batch.clear();
            break;
        }

        match item {
            Ok(raw) => {
                let record = RawRecord::Legacy(raw);
                match normalize::normalize(&record) {
                    Ok(post) => batch.push(post),
                    Err(err) => {
                        summary.failed += 1;
                        warn!(%err, external_id = %record.external_id(), "record not normalized");
                    }
                }
            }
            Err(err) if err.is_per_record() => {
                summary.failed += 1;
            }
            Err(err) => return Err(err),
        }

        if batch.len() >= opts.batch_size {
            flush(pool, &mut batch, opts, false, summary, cancel).await?;
        }
    }

    flush(pool, &mut batch, opts, false, summary, cancel).await?;
    info!(skipped_rows = scan.skipped(), "legacy scan finished");
    Ok(())
}

/// Write the buffered posts as one transaction (retrying a conflicted batch
/// once), or predict outcomes without writing on a dry run.
async fn flush(
    pool: &Pool,
    batch: &mut Vec<Post>,
    opts: &RunOptions,
    advance_checkpoint: bool,
    summary: &mut RunSummary,
    cancel: &AtomicBool,
) -> Result<(), PipelineError> {
    if batch.is_empty() {
        return Ok(());
    }
    if cancel.load(Ordering::Relaxed) {
        warn!(buffered = batch.len(), "cancelled; dropping unwritten batch");
        batch.clear();
        return Ok(());
    }

    if opts.dry_run {
        for post in batch.iter() {
            let outcome = engine::evaluate(pool, post).await?;
            summary.record(outcome);
        }
        batch.clear();
        return Ok(());
    }

    let outcomes = match write_once(pool, batch, advance_checkpoint).await {
        Ok(outcomes) => outcomes,
        Err(PipelineError::PersistenceConflict(err)) => {
            warn!(%err, "batch write conflict; retrying once");
            write_once(pool, batch, advance_checkpoint).await?
        }
        Err(err) => return Err(err),
    };

    for outcome in outcomes {
        summary.record(outcome);
    }
    info!(
        inserted = summary.inserted,
        updated = summary.updated,
        skipped = summary.skipped,
        failed = summary.failed,
        "batch committed"
    );
    batch.clear();
    Ok(())
}

async fn write_once(
    pool: &Pool,
    batch: &[Post],
    advance_checkpoint: bool,
) -> Result<Vec<Outcome>, PipelineError> {
    let imported_at = Utc::now();
    let mut tx = pool.begin().await?;
    let mut outcomes = Vec::with_capacity(batch.len());
    for post in batch {
        outcomes.push(engine::apply_tx(&mut tx, post, imported_at).await?);
    }

    if advance_checkpoint {
        let last_id = batch
            .iter()
            .filter_map(|p| p.external_id.parse::<i64>().ok())
            .max();
        if let Some(last_id) = last_id {
            let new = outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Inserted))
                .count() as i64;
            if let Some(source) = batch.first().map(|p| p.source) {
                db::advance_checkpoint_tx(&mut tx, source, last_id, new).await?;
            }
        }
    }

    tx.commit().await?;
    Ok(outcomes)
}
