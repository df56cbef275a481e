//! Legacy CMS source adapter: scans a DataLife Engine MySQL dump.
//!
//! The dump is parsed statement-wise: `dle_category`, `dle_tags` and
//! `dle_images` are small lookup tables loaded up front, then `dle_post`
//! rows are yielded lazily, each already joined with its categories, tags
//! and attachments. A malformed row is logged and counted, never fatal.

use crate::error::PipelineError;
use crate::model::LegacyRaw;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

static CATEGORY_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)INSERT INTO `dle_category` VALUES (.+?);").unwrap());
static IMAGES_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)INSERT INTO `dle_images` VALUES (.+?);").unwrap());
static TAGS_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)INSERT INTO `dle_tags` VALUES (.+?);").unwrap());
static POST_SECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)INSERT INTO `dle_post` VALUES (.+?);\n").unwrap());

// (id,parentid,posi,'name','alt_name',...)
static CATEGORY_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+),(\d+),\d+,'([^']*?)','([^']*?)'").unwrap());
// (id,'images',news_id,'author','date') where images is a |||-separated list
static IMAGE_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+),'([^']*?)',(\d+),'([^']*?)','(\d+)'\)").unwrap());
// (id,news_id,'tag')
static TAG_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+),(\d+),'([^']*?)'\)").unwrap());

static BB_BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[b\](.*?)\[/b\]").unwrap());
static BB_ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[i\](.*?)\[/i\]").unwrap());
static BB_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[url=([^\]]+)\](.*?)\[/url\]").unwrap());
static BB_IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[img\](.*?)\[/img\]").unwrap());
static BB_LEFTOVER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[/?[a-zA-Z][^\]]*\]").unwrap());
static HTML_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Lazy scan over the `dle_post` rows of a dump file.
///
/// Lookup tables are resolved eagerly; article rows are parsed one at a
/// time so the whole dump never needs to live in memory twice.
pub struct DumpScan {
    values: String,
    pos: usize,
    categories: HashMap<i64, String>,
    tags: HashMap<i64, Vec<String>>,
    images: HashMap<i64, Vec<String>>,
    skipped: u64,
}

impl DumpScan {
    /// Rows that failed to parse so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Open and index a dump file. Missing or unreadable files are fatal; the
/// absence of individual sections is not (an empty channel is a valid dump).
pub fn scan(path: &Path) -> Result<DumpScan, PipelineError> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        PipelineError::SourceUnavailable(format!("cannot read dump {}: {err}", path.display()))
    })?;

    let categories = parse_categories(&content);
    let tags = parse_tags(&content);
    let images = parse_images(&content);

    let values = POST_SECTION
        .captures(&content)
        .or_else(|| {
            // Dumps that end without a trailing newline.
            Regex::new(r"(?s)INSERT INTO `dle_post` VALUES (.+?);\s*$")
                .ok()
                .and_then(|re| re.captures(&content))
        })
        .map(|c| c[1].to_string())
        .unwrap_or_default();

    Ok(DumpScan {
        values,
        pos: 0,
        categories,
        tags,
        images,
        skipped: 0,
    })
}

fn parse_categories(content: &str) -> HashMap<i64, String> {
    let mut out = HashMap::new();
    let Some(section) = CATEGORY_SECTION.captures(content) else {
        return out;
    };
    for row in CATEGORY_ROW.captures_iter(&section[1]) {
        if let Ok(id) = row[1].parse::<i64>() {
            out.insert(id, unescape_sql(&row[3]));
        }
    }
    out
}

fn parse_tags(content: &str) -> HashMap<i64, Vec<String>> {
    let mut out: HashMap<i64, Vec<String>> = HashMap::new();
    let Some(section) = TAGS_SECTION.captures(content) else {
        return out;
    };
    for row in TAG_ROW.captures_iter(&section[1]) {
        if let Ok(news_id) = row[2].parse::<i64>() {
            let tag = unescape_sql(&row[3]);
            if !tag.trim().is_empty() {
                out.entry(news_id).or_default().push(tag);
            }
        }
    }
    out
}

fn parse_images(content: &str) -> HashMap<i64, Vec<String>> {
    let mut out: HashMap<i64, Vec<String>> = HashMap::new();
    let Some(section) = IMAGES_SECTION.captures(content) else {
        return out;
    };
    for row in IMAGE_ROW.captures_iter(&section[1]) {
        if let Ok(news_id) = row[3].parse::<i64>() {
            let paths = row[2]
                .split("|||")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from);
            out.entry(news_id).or_default().extend(paths);
        }
    }
    out
}

impl Iterator for DumpScan {
    type Item = Result<LegacyRaw, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.values[self.pos..].find('(')? + self.pos;
        let Some(end) = find_record_end(&self.values, start) else {
            // Truncated trailing record: count and stop.
            self.pos = self.values.len();
            self.skipped += 1;
            warn!("dump ends in an unterminated record");
            return Some(Err(PipelineError::MalformedRecord {
                external_id: None,
                reason: "unterminated record".into(),
            }));
        };
        let record = &self.values[start + 1..end];
        self.pos = end + 1;

        match parse_post_record(record, &self.categories, &self.tags, &self.images) {
            Ok(raw) => Some(Ok(raw)),
            Err(err) => {
                self.skipped += 1;
                warn!(%err, "skipping malformed dump row");
                Some(Err(err))
            }
        }
    }
}

/// Find the closing paren of a record, honouring quoted commas and parens.
fn find_record_end(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = start + 1;
    let mut in_quote = false;
    let mut depth = 1u32;

    while i < bytes.len() && depth > 0 {
        let c = bytes[i];
        if c == b'\'' && (i == 0 || bytes[i - 1] != b'\\') {
            in_quote = !in_quote;
        } else if !in_quote {
            if c == b'(' {
                depth += 1;
            } else if c == b')' {
                depth -= 1;
            }
        }
        i += 1;
    }

    if depth == 0 {
        Some(i - 1)
    } else {
        None
    }
}

/// Split a record body on commas, honouring quoted fields.
fn split_sql_values(record: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut prev = '\0';

    for (i, c) in record.char_indices() {
        if c == '\'' && (i == 0 || prev != '\\') {
            in_quote = !in_quote;
            current.push('\'');
        } else if c == ',' && !in_quote {
            fields.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
        prev = c;
    }
    if !current.is_empty() {
        fields.push(current.trim().to_string());
    }
    fields
}

fn malformed(id: Option<i64>, reason: impl Into<String>) -> PipelineError {
    PipelineError::MalformedRecord {
        external_id: id.map(|v| v.to_string()),
        reason: reason.into(),
    }
}

fn parse_post_record(
    record: &str,
    categories: &HashMap<i64, String>,
    tags: &HashMap<i64, Vec<String>>,
    images: &HashMap<i64, Vec<String>>,
) -> Result<LegacyRaw, PipelineError> {
    let fields = split_sql_values(record);
    if fields.len() < 11 {
        return Err(malformed(
            None,
            format!("expected at least 11 fields, got {}", fields.len()),
        ));
    }

    let post_id: i64 = fields[0]
        .parse()
        .map_err(|_| malformed(None, format!("bad article id `{}`", fields[0])))?;

    let strip = |s: &str| unescape_sql(s.trim_matches('\''));
    let author = strip(&fields[1]);
    let date_raw = strip(&fields[2]);
    let short_story = translate_markup(&strip(&fields[3]));
    let full_story = translate_markup(&strip(&fields[4]));
    let xfields = parse_xfields(&strip(&fields[5]));
    let title = strip(&fields[6]);
    let category_ids = strip(&fields[9]);
    let alt_name = strip(&fields[10]);

    if title.is_empty() && full_story.is_empty() && short_story.is_empty() {
        return Err(malformed(Some(post_id), "empty title and story"));
    }

    let category_names: Vec<String> = category_ids
        .split(',')
        .filter_map(|id| id.trim().parse::<i64>().ok())
        .filter_map(|id| categories.get(&id).cloned())
        .collect();

    // Merge attachment sources in first-seen order: the xfields main image,
    // the xfields gallery, then the dle_images rows.
    let mut seen = Vec::new();
    let mut push = |raw: &str, seen: &mut Vec<String>| {
        let resolved = resolve_media_path(raw);
        if !resolved.is_empty() && !seen.contains(&resolved) {
            seen.push(resolved);
        }
    };
    if let Some(main) = xfields.get("image1") {
        push(main, &mut seen);
    }
    if let Some(gallery) = xfields.get("gallery") {
        for item in gallery.split(',') {
            push(item.trim(), &mut seen);
        }
    }
    if let Some(extra) = images.get(&post_id) {
        for item in extra {
            push(item, &mut seen);
        }
    }

    Ok(LegacyRaw {
        post_id,
        author,
        date_raw,
        title,
        short_story,
        full_story,
        xfields,
        category_names,
        tags: tags.get(&post_id).cloned().unwrap_or_default(),
        images: seen,
        alt_name,
    })
}

/// Parse the DLE extra-fields encoding: `key|value||key|value||...`.
fn parse_xfields(s: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if s.is_empty() {
        return out;
    }
    for pair in s.split("||") {
        if let Some((key, value)) = pair.split_once('|') {
            let key = key.trim();
            if !key.is_empty() {
                out.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    out
}

fn unescape_sql(s: &str) -> String {
    s.replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\\'", "'")
        .replace("\\\"", "\"")
        .replace("\\\\", "\\")
}

/// Translate DLE markup (BB-style tags, `<br>`, `{PAGEBREAK}`) into plain
/// markdown so legacy syntax never leaks into canonical bodies.
pub fn translate_markup(s: &str) -> String {
    let s = HTML_BREAK.replace_all(s, "\n");
    let s = s.replace("{PAGEBREAK}", "\n\n");
    let s = BB_BOLD.replace_all(&s, "**$1**");
    let s = BB_ITALIC.replace_all(&s, "*$1*");
    let s = BB_URL.replace_all(&s, "[$2]($1)");
    let s = BB_IMG.replace_all(&s, "![]($1)");
    let s = BB_LEFTOVER.replace_all(&s, "");
    let s = HTML_TAG.replace_all(&s, "");
    s.trim().to_string()
}

/// Attachment paths in the dump are relative to the legacy `posts/` tree
/// unless they are already absolute URLs.
fn resolve_media_path(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    format!("posts/{}", raw.trim_start_matches('/'))
}
