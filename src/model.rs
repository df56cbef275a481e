use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Originating system of a canonical post.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Source {
    Telegram,
    LegacyCms,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Telegram => "telegram",
            Source::LegacyCms => "legacy_cms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(Source::Telegram),
            "legacy_cms" => Some(Source::LegacyCms),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "file" => Some(MediaKind::File),
            _ => None,
        }
    }
}

/// One media attachment owned by a post. `locator` is a staged file path for
/// downloaded blobs, otherwise the origin reference from the source dump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Media {
    pub kind: MediaKind,
    pub locator: String,
    pub origin_url: Option<String>,
    pub checksum: Option<String>,
}

/// Canonical, source-independent content record.
///
/// Invariants enforced by the normalizer: `published_at` is valid and `body`
/// is non-empty or at least one media entry is present. `(source,
/// external_id)` uniqueness is enforced by the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub source: Source,
    pub external_id: String,
    pub title: Option<String>,
    pub body: String,
    pub media: Vec<Media>,
    /// Normalized tag names, deduplicated and sorted.
    pub tags: Vec<String>,
    /// Normalized category name, if the source carries one.
    pub category: Option<String>,
    pub published_at: DateTime<Utc>,
    /// Source-native metadata kept verbatim for later re-parsing.
    pub raw: serde_json::Value,
}

/// A media blob the Telegram adapter has already downloaded and checksummed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBlob {
    pub kind: MediaKind,
    pub origin_url: String,
    pub path: String,
    pub checksum: String,
}

/// Raw Telegram channel message, as extracted from one preview-page entry.
#[derive(Debug, Clone)]
pub struct TelegramRaw {
    pub message_id: i64,
    pub published_at: Option<DateTime<Utc>>,
    pub text: String,
    pub blobs: Vec<StagedBlob>,
}

/// Raw legacy article row, joined in-adapter with its categories, tags and
/// attachments so the normalizer needs no second lookup.
#[derive(Debug, Clone)]
pub struct LegacyRaw {
    pub post_id: i64,
    pub author: String,
    pub date_raw: String,
    pub title: String,
    pub short_story: String,
    pub full_story: String,
    pub xfields: BTreeMap<String, String>,
    pub category_names: Vec<String>,
    pub tags: Vec<String>,
    /// Resolved attachment locators, first-seen order, already deduplicated.
    pub images: Vec<String>,
    pub alt_name: String,
}

/// Tagged union over the source-specific raw shapes, so the normalizer's
/// mapping is exhaustive.
#[derive(Debug, Clone)]
pub enum RawRecord {
    Telegram(TelegramRaw),
    Legacy(LegacyRaw),
}

impl RawRecord {
    pub fn source(&self) -> Source {
        match self {
            RawRecord::Telegram(_) => Source::Telegram,
            RawRecord::Legacy(_) => Source::LegacyCms,
        }
    }

    pub fn external_id(&self) -> String {
        match self {
            RawRecord::Telegram(raw) => raw.message_id.to_string(),
            RawRecord::Legacy(raw) => raw.post_id.to_string(),
        }
    }
}

/// Decision the dedup/upsert engine reached for one post.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Inserted => "inserted",
            Outcome::Updated => "updated",
            Outcome::Skipped => "skipped",
        }
    }
}

/// Aggregated counts for one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: Source,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RunSummary {
    pub fn new(source: Source) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source,
            inserted: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.inserted + self.updated + self.skipped + self.failed
    }
}
