use super::model::{Checkpoint, PostRef};
use crate::error::PipelineError;
use crate::model::{Media, Post, Source};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL with strict durability; cascades need foreign keys enabled.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Run leases
// ---------------------------------------------------------------------------

/// Acquire the per-source run lease or fail with `ConcurrentRunDetected`.
/// The expiry bounds leakage from a crashed run.
#[instrument(skip_all, fields(source = source.as_str()))]
pub async fn acquire_lease(
    pool: &Pool,
    source: Source,
    holder: &str,
    ttl_seconds: i64,
) -> Result<(), PipelineError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let existing: Option<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT holder, expires_at FROM run_leases WHERE source = ?")
            .bind(source.as_str())
            .fetch_optional(&mut *tx)
            .await?;

    if let Some((other, expires_at)) = existing {
        if other != holder && expires_at > now {
            return Err(PipelineError::ConcurrentRunDetected {
                source_name: source.as_str().to_string(),
            });
        }
    }

    sqlx::query(
        "INSERT INTO run_leases (source, holder, acquired_at, expires_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(source) DO UPDATE SET holder = excluded.holder, \
         acquired_at = excluded.acquired_at, expires_at = excluded.expires_at",
    )
    .bind(source.as_str())
    .bind(holder)
    .bind(now)
    .bind(now + Duration::seconds(ttl_seconds))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all, fields(source = source.as_str()))]
pub async fn release_lease(pool: &Pool, source: Source, holder: &str) -> Result<(), PipelineError> {
    sqlx::query("DELETE FROM run_leases WHERE source = ? AND holder = ?")
        .bind(source.as_str())
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Import checkpoints
// ---------------------------------------------------------------------------

pub async fn get_checkpoint(pool: &Pool, source: Source) -> Result<Option<Checkpoint>, PipelineError> {
    let row = sqlx::query(
        "SELECT last_external_id, total_imported FROM import_state WHERE source = ?",
    )
    .bind(source.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Checkpoint {
        last_external_id: row.get("last_external_id"),
        total_imported: row.get("total_imported"),
    }))
}

/// Advance the checkpoint inside the batch transaction: the cursor only
/// moves forward, and it moves together with the rows it covers.
pub async fn advance_checkpoint_tx(
    tx: &mut Transaction<'_, Sqlite>,
    source: Source,
    last_external_id: i64,
    newly_imported: i64,
) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO import_state (source, last_external_id, total_imported, updated_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(source) DO UPDATE SET \
         last_external_id = MAX(import_state.last_external_id, excluded.last_external_id), \
         total_imported = import_state.total_imported + excluded.total_imported, \
         updated_at = excluded.updated_at",
    )
    .bind(source.as_str())
    .bind(last_external_id)
    .bind(newly_imported)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Posts
// ---------------------------------------------------------------------------

pub async fn exists(pool: &Pool, source: Source, external_id: &str) -> Result<bool, PipelineError> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM posts WHERE source = ? AND external_id = ?")
            .bind(source.as_str())
            .bind(external_id)
            .fetch_optional(pool)
            .await?;
    Ok(id.is_some())
}

pub async fn count_posts(pool: &Pool, source: Source) -> Result<i64, PipelineError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE source = ?")
        .bind(source.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn find_post_tx(
    tx: &mut Transaction<'_, Sqlite>,
    source: Source,
    external_id: &str,
) -> Result<Option<PostRef>, PipelineError> {
    let row = sqlx::query("SELECT id, fingerprint FROM posts WHERE source = ? AND external_id = ?")
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&mut **tx)
        .await?;

    Ok(row.map(|row| PostRef {
        id: row.get("id"),
        fingerprint: row.get("fingerprint"),
    }))
}

/// Read-only variant of `find_post_tx` for dry runs.
pub async fn find_post(
    pool: &Pool,
    source: Source,
    external_id: &str,
) -> Result<Option<PostRef>, PipelineError> {
    let row = sqlx::query("SELECT id, fingerprint FROM posts WHERE source = ? AND external_id = ?")
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| PostRef {
        id: row.get("id"),
        fingerprint: row.get("fingerprint"),
    }))
}

pub async fn insert_post_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post: &Post,
    category_id: Option<i64>,
    fingerprint: &str,
    imported_at: DateTime<Utc>,
) -> Result<i64, PipelineError> {
    let rec = sqlx::query(
        "INSERT INTO posts (source, external_id, title, body, category_id, published_at, \
         imported_at, fingerprint, raw) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(post.source.as_str())
    .bind(&post.external_id)
    .bind(&post.title)
    .bind(&post.body)
    .bind(category_id)
    .bind(post.published_at)
    .bind(imported_at)
    .bind(fingerprint)
    .bind(post.raw.to_string())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

pub async fn update_post_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post_id: i64,
    post: &Post,
    category_id: Option<i64>,
    fingerprint: &str,
    imported_at: DateTime<Utc>,
) -> Result<(), PipelineError> {
    sqlx::query(
        "UPDATE posts SET title = ?, body = ?, category_id = ?, published_at = ?, \
         imported_at = ?, fingerprint = ?, raw = ? WHERE id = ?",
    )
    .bind(&post.title)
    .bind(&post.body)
    .bind(category_id)
    .bind(post.published_at)
    .bind(imported_at)
    .bind(fingerprint)
    .bind(post.raw.to_string())
    .bind(post_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Replace the owned media rows of a post, preserving declared order.
pub async fn replace_media_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post_id: i64,
    media: &[Media],
) -> Result<(), PipelineError> {
    sqlx::query("DELETE FROM media WHERE post_id = ?")
        .bind(post_id)
        .execute(&mut **tx)
        .await?;

    for (position, item) in media.iter().enumerate() {
        sqlx::query(
            "INSERT INTO media (post_id, position, kind, locator, origin_url, checksum) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(post_id)
        .bind(position as i64)
        .bind(item.kind.as_str())
        .bind(&item.locator)
        .bind(&item.origin_url)
        .bind(&item.checksum)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Categories and tags (idempotent by normalized name)
// ---------------------------------------------------------------------------

pub async fn get_or_create_category_tx(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
) -> Result<i64, PipelineError> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM categories WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO categories (name) VALUES (?) RETURNING id")
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;
    Ok(rec.get("id"))
}

pub async fn get_or_create_tag_tx(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
) -> Result<i64, PipelineError> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM tags WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query("INSERT INTO tags (name) VALUES (?) RETURNING id")
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;
    Ok(rec.get("id"))
}

pub async fn set_post_tags_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post_id: i64,
    tag_ids: &[i64],
) -> Result<(), PipelineError> {
    sqlx::query("DELETE FROM post_tags WHERE post_id = ?")
        .bind(post_id)
        .execute(&mut **tx)
        .await?;
    for tag_id in tag_ids {
        sqlx::query("INSERT INTO post_tags (post_id, tag_id) VALUES (?, ?)")
            .bind(post_id)
            .bind(tag_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Clear mode
// ---------------------------------------------------------------------------

/// Remove every post of a source plus the categories/tags nothing references
/// afterwards, in one transaction. Returns the number of posts removed.
#[instrument(skip_all, fields(source = source.as_str()))]
pub async fn clear_source(pool: &Pool, source: Source) -> Result<u64, PipelineError> {
    let mut tx = pool.begin().await?;

    let removed = sqlx::query("DELETE FROM posts WHERE source = ?")
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query(
        "DELETE FROM categories WHERE id NOT IN \
         (SELECT category_id FROM posts WHERE category_id IS NOT NULL)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM tags WHERE id NOT IN (SELECT tag_id FROM post_tags)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM import_state WHERE source = ?")
        .bind(source.as_str())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://x/y"),
            "postgres://x/y".to_string()
        );
        assert!(prepare_sqlite_url("sqlite:///tmp/a/b.db").starts_with("sqlite:///tmp/a/b.db"));
    }

    #[tokio::test]
    async fn lease_blocks_second_holder() {
        let pool = setup_pool().await;
        acquire_lease(&pool, Source::Telegram, "run-a", 3600)
            .await
            .unwrap();
        let err = acquire_lease(&pool, Source::Telegram, "run-b", 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrentRunDetected { .. }));

        // Other sources are independent, and release frees the lease.
        acquire_lease(&pool, Source::LegacyCms, "run-b", 3600)
            .await
            .unwrap();
        release_lease(&pool, Source::Telegram, "run-a").await.unwrap();
        acquire_lease(&pool, Source::Telegram, "run-b", 3600)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_reacquirable() {
        let pool = setup_pool().await;
        acquire_lease(&pool, Source::Telegram, "run-a", -1)
            .await
            .unwrap();
        acquire_lease(&pool, Source::Telegram, "run-b", 3600)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checkpoint_moves_forward_only() {
        let pool = setup_pool().await;
        assert!(get_checkpoint(&pool, Source::Telegram).await.unwrap().is_none());

        let mut tx = pool.begin().await.unwrap();
        advance_checkpoint_tx(&mut tx, Source::Telegram, 100, 5)
            .await
            .unwrap();
        advance_checkpoint_tx(&mut tx, Source::Telegram, 90, 2)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let cp = get_checkpoint(&pool, Source::Telegram).await.unwrap().unwrap();
        assert_eq!(cp.last_external_id, 100);
        assert_eq!(cp.total_imported, 7);
    }

    #[tokio::test]
    async fn category_upsert_is_idempotent() {
        let pool = setup_pool().await;
        let mut tx = pool.begin().await.unwrap();
        let a = get_or_create_category_tx(&mut tx, "news").await.unwrap();
        let b = get_or_create_category_tx(&mut tx, "news").await.unwrap();
        assert_eq!(a, b);
        let c = get_or_create_tag_tx(&mut tx, "bmw").await.unwrap();
        let d = get_or_create_tag_tx(&mut tx, "bmw").await.unwrap();
        assert_eq!(c, d);
        tx.commit().await.unwrap();
    }
}
