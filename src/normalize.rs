//! Pure normalization of raw source records into canonical posts.
//!
//! No I/O happens here. Every record either becomes a valid `Post` or a
//! `Normalization` error naming the offending field.

use crate::error::PipelineError;
use crate::model::{LegacyRaw, Media, MediaKind, Post, RawRecord, Source, TelegramRaw};
use chrono::{NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeSet;

const MAX_TITLE_LEN: usize = 200;

static HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"#([\p{L}\p{N}_]+)").unwrap());

/// Canonical form for category and tag names: trimmed, case-folded, inner
/// whitespace collapsed. Equivalent names from different sources collapse to
/// one row ("News " and "news" are the same category).
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn err(field: &'static str, reason: impl Into<String>) -> PipelineError {
    PipelineError::Normalization {
        field,
        reason: reason.into(),
    }
}

pub fn normalize(raw: &RawRecord) -> Result<Post, PipelineError> {
    match raw {
        RawRecord::Telegram(raw) => normalize_telegram(raw),
        RawRecord::Legacy(raw) => normalize_legacy(raw),
    }
}

fn normalize_telegram(raw: &TelegramRaw) -> Result<Post, PipelineError> {
    if raw.message_id <= 0 {
        return Err(err("external_id", "message id must be positive"));
    }
    let published_at = raw
        .published_at
        .ok_or_else(|| err("published_at", "message carries no timestamp"))?;

    let body = raw.text.trim().to_string();
    let media: Vec<Media> = raw
        .blobs
        .iter()
        .map(|blob| Media {
            kind: blob.kind,
            locator: blob.path.clone(),
            origin_url: Some(blob.origin_url.clone()),
            checksum: Some(blob.checksum.clone()),
        })
        .collect();

    if body.is_empty() && media.is_empty() {
        return Err(err("body", "empty message without media"));
    }

    let title = body
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| truncate_chars(line, MAX_TITLE_LEN));

    let tags: Vec<String> = HASHTAG
        .captures_iter(&body)
        .map(|c| normalize_name(&c[1]))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(Post {
        source: Source::Telegram,
        external_id: raw.message_id.to_string(),
        title,
        body,
        media,
        tags,
        category: None,
        published_at,
        raw: json!({
            "message_id": raw.message_id,
            "blob_count": raw.blobs.len(),
        }),
    })
}

fn normalize_legacy(raw: &LegacyRaw) -> Result<Post, PipelineError> {
    if raw.post_id <= 0 {
        return Err(err("external_id", "article id must be positive"));
    }

    let naive = NaiveDateTime::parse_from_str(&raw.date_raw, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| err("published_at", format!("unparseable date `{}`", raw.date_raw)))?;
    let published_at = Utc.from_utc_datetime(&naive);

    let body = if !raw.full_story.is_empty() {
        raw.full_story.clone()
    } else {
        raw.short_story.clone()
    };

    let media: Vec<Media> = raw
        .images
        .iter()
        .map(|locator| Media {
            kind: MediaKind::Image,
            locator: locator.clone(),
            origin_url: None,
            checksum: None,
        })
        .collect();

    if body.is_empty() && media.is_empty() {
        return Err(err("body", "empty story without attachments"));
    }

    let title = Some(raw.title.trim())
        .filter(|t| !t.is_empty())
        .map(|t| truncate_chars(t, MAX_TITLE_LEN));

    let category = raw
        .category_names
        .iter()
        .map(|name| normalize_name(name))
        .find(|name| !name.is_empty());

    let tags: Vec<String> = raw
        .tags
        .iter()
        .map(|t| normalize_name(t))
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(Post {
        source: Source::LegacyCms,
        external_id: raw.post_id.to_string(),
        title,
        body,
        media,
        tags,
        category,
        published_at,
        raw: json!({
            "author": raw.author,
            "alt_name": raw.alt_name,
            "xfields": raw.xfields,
        }),
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StagedBlob;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn telegram_raw(text: &str) -> TelegramRaw {
        TelegramRaw {
            message_id: 42,
            published_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
            text: text.to_string(),
            blobs: vec![],
        }
    }

    fn legacy_raw() -> LegacyRaw {
        LegacyRaw {
            post_id: 7,
            author: "admin".into(),
            date_raw: "2015-03-02 12:30:00".into(),
            title: "Toyota Prius".into(),
            short_story: "short".into(),
            full_story: "full story".into(),
            xfields: BTreeMap::new(),
            category_names: vec!["News ".into()],
            tags: vec!["Hybrid".into(), " hybrid".into()],
            images: vec!["posts/prius.jpg".into()],
            alt_name: "toyota-prius".into(),
        }
    }

    #[test]
    fn name_normalization_collapses_variants() {
        assert_eq!(normalize_name("News "), "news");
        assert_eq!(normalize_name("  Used\t CARS "), "used cars");
        assert_eq!(normalize_name("news"), "news");
    }

    #[test]
    fn telegram_title_is_first_nonempty_line() {
        let post = normalize(&RawRecord::Telegram(telegram_raw("\n\nBMW X1\nгод: 2021")))
            .unwrap();
        assert_eq!(post.title.as_deref(), Some("BMW X1"));
        assert_eq!(post.source, Source::Telegram);
        assert_eq!(post.external_id, "42");
    }

    #[test]
    fn telegram_hashtags_become_tags() {
        let post = normalize(&RawRecord::Telegram(telegram_raw(
            "BMW X1 #Бмв #bmw #БМВ в наличии",
        )))
        .unwrap();
        assert_eq!(post.tags, vec!["bmw".to_string(), "бмв".to_string()]);
    }

    #[test]
    fn empty_telegram_message_is_rejected() {
        let raw = telegram_raw("   ");
        let err = normalize(&RawRecord::Telegram(raw)).unwrap_err();
        match err {
            PipelineError::Normalization { field, .. } => assert_eq!(field, "body"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_message_with_media_is_valid() {
        let mut raw = telegram_raw("");
        raw.blobs.push(StagedBlob {
            kind: MediaKind::Image,
            origin_url: "https://cdn/x.jpg".into(),
            path: "staging/x.jpg".into(),
            checksum: "abc".into(),
        });
        let post = normalize(&RawRecord::Telegram(raw)).unwrap();
        assert!(post.body.is_empty());
        assert_eq!(post.media.len(), 1);
        assert_eq!(post.media[0].checksum.as_deref(), Some("abc"));
    }

    #[test]
    fn missing_timestamp_is_reported() {
        let mut raw = telegram_raw("text");
        raw.published_at = None;
        let err = normalize(&RawRecord::Telegram(raw)).unwrap_err();
        match err {
            PipelineError::Normalization { field, .. } => assert_eq!(field, "published_at"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn legacy_category_and_tags_are_normalized() {
        let post = normalize(&RawRecord::Legacy(legacy_raw())).unwrap();
        assert_eq!(post.category.as_deref(), Some("news"));
        assert_eq!(post.tags, vec!["hybrid".to_string()]);
        assert_eq!(post.body, "full story");
        assert_eq!(
            post.published_at,
            Utc.with_ymd_and_hms(2015, 3, 2, 12, 30, 0).unwrap()
        );
    }

    #[test]
    fn legacy_bad_date_is_reported() {
        let mut raw = legacy_raw();
        raw.date_raw = "not a date".into();
        let err = normalize(&RawRecord::Legacy(raw)).unwrap_err();
        match err {
            PipelineError::Normalization { field, .. } => assert_eq!(field, "published_at"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn legacy_falls_back_to_short_story() {
        let mut raw = legacy_raw();
        raw.full_story = String::new();
        let post = normalize(&RawRecord::Legacy(raw)).unwrap();
        assert_eq!(post.body, "short");
    }
}
