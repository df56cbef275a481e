//! Dedup/upsert engine: decides insert/update/skip per canonical post and
//! owns the content fingerprint.

use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::model::{Outcome, Post};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, Transaction};
use tracing::instrument;

/// Hash over a post's semantically meaningful fields: title, body, ordered
/// media identities and sorted tags. Fields are length-prefixed so adjacent
/// values cannot run into each other.
pub fn fingerprint(post: &Post) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |part: &str| {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    };

    feed(post.title.as_deref().unwrap_or(""));
    feed(&post.body);
    for media in &post.media {
        feed(media.checksum.as_deref().unwrap_or(&media.locator));
    }
    for tag in &post.tags {
        feed(tag);
    }
    hex::encode(hasher.finalize())
}

/// Upsert one post inside an open batch transaction.
///
/// The key is `(source, external_id)`: absent inserts, identical
/// fingerprint skips (no `imported_at` churn), anything else updates in
/// place with media rows and tag links rewritten. Categories and tags are
/// created before the post row that references them.
pub async fn apply_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post: &Post,
    imported_at: DateTime<Utc>,
) -> Result<Outcome, PipelineError> {
    let fp = fingerprint(post);
    let existing = db::find_post_tx(tx, post.source, &post.external_id).await?;

    if let Some(existing) = &existing {
        if existing.fingerprint == fp {
            return Ok(Outcome::Skipped);
        }
    }

    let category_id = match &post.category {
        Some(name) => Some(db::get_or_create_category_tx(tx, name).await?),
        None => None,
    };
    let mut tag_ids = Vec::with_capacity(post.tags.len());
    for tag in &post.tags {
        tag_ids.push(db::get_or_create_tag_tx(tx, tag).await?);
    }

    let (post_id, outcome) = match existing {
        None => {
            let id = db::insert_post_tx(tx, post, category_id, &fp, imported_at).await?;
            (id, Outcome::Inserted)
        }
        Some(existing) => {
            db::update_post_tx(tx, existing.id, post, category_id, &fp, imported_at).await?;
            (existing.id, Outcome::Updated)
        }
    };

    db::replace_media_tx(tx, post_id, &post.media).await?;
    db::set_post_tags_tx(tx, post_id, &tag_ids).await?;

    Ok(outcome)
}

/// Write one batch of posts in a single transaction and report the per-item
/// outcomes. A failure rolls the whole batch back; previously committed
/// batches are untouched.
#[instrument(skip_all, fields(batch = posts.len()))]
pub async fn write_batch(pool: &Pool, posts: &[Post]) -> Result<Vec<Outcome>, PipelineError> {
    let imported_at = Utc::now();
    let mut tx = pool.begin().await?;
    let mut outcomes = Vec::with_capacity(posts.len());
    for post in posts {
        outcomes.push(apply_tx(&mut tx, post, imported_at).await?);
    }
    tx.commit().await?;
    Ok(outcomes)
}

/// Read-only outcome prediction used by dry runs: what `write_batch` would
/// decide, without writing anything.
pub async fn evaluate(pool: &Pool, post: &Post) -> Result<Outcome, PipelineError> {
    let fp = fingerprint(post);
    Ok(match db::find_post(pool, post.source, &post.external_id).await? {
        None => Outcome::Inserted,
        Some(existing) if existing.fingerprint == fp => Outcome::Skipped,
        Some(_) => Outcome::Updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Media, MediaKind, Source};
    use chrono::TimeZone;

    fn sample_post() -> Post {
        Post {
            source: Source::Telegram,
            external_id: "42".into(),
            title: Some("BMW X1".into()),
            body: "BMW X1, 2021".into(),
            media: vec![Media {
                kind: MediaKind::Image,
                locator: "staging/42_0.jpg".into(),
                origin_url: Some("https://cdn/42.jpg".into()),
                checksum: Some("aa11".into()),
            }],
            tags: vec!["bmw".into()],
            category: None,
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn fingerprint_is_stable() {
        let post = sample_post();
        assert_eq!(fingerprint(&post), fingerprint(&post.clone()));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let post = sample_post();
        let mut changed = post.clone();
        changed.body.push_str(" sold");
        assert_ne!(fingerprint(&post), fingerprint(&changed));

        let mut retagged = post.clone();
        retagged.tags.push("x1".into());
        assert_ne!(fingerprint(&post), fingerprint(&retagged));

        let mut new_blob = post.clone();
        new_blob.media[0].checksum = Some("bb22".into());
        assert_ne!(fingerprint(&post), fingerprint(&new_blob));
    }

    #[test]
    fn fingerprint_fields_do_not_bleed() {
        let mut a = sample_post();
        a.title = Some("ab".into());
        a.body = "c".into();
        let mut b = sample_post();
        b.title = Some("a".into());
        b.body = "bc".into();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
