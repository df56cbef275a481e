//! Telegram source adapter: crawls a channel's public preview pages.
//!
//! Pages come from `https://t.me/s/{channel}`, newest messages last; the
//! `before={message_id}` query parameter pages backwards through history.
//! The adapter owns retry/backoff and request pacing — callers never need
//! knowledge of the source's quotas. Media blobs are staged to disk and
//! checksummed before a record is handed to the normalizer, so a message
//! whose media cannot be fetched never produces a partial post.

use crate::error::PipelineError;
use crate::model::{MediaKind, StagedBlob, TelegramRaw};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status(code) => *code == 429 || *code >= 500,
        }
    }
}

/// Minimal surface the fetcher needs from the network; tests substitute a
/// scripted implementation.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Fetch one preview page, older than `before` when given.
    async fn fetch_page(&self, channel: &str, before: Option<i64>) -> Result<String, FetchError>;

    /// Download one media blob.
    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Clone)]
pub struct HttpChannelClient {
    http: Client,
    base_url: Url,
}

impl HttpChannelClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let http = Client::builder()
            .user_agent("catalog-ingest/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, base_url })
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, FetchError> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        if !res.status().is_success() {
            return Err(FetchError::Status(res.status().as_u16()));
        }
        Ok(res)
    }
}

#[async_trait]
impl ChannelClient for HttpChannelClient {
    async fn fetch_page(&self, channel: &str, before: Option<i64>) -> Result<String, FetchError> {
        let mut url = self
            .base_url
            .join(&format!("s/{channel}"))
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        if let Some(before) = before {
            url.query_pairs_mut()
                .append_pair("before", &before.to_string());
        }
        debug!(%url, "fetching channel page");
        let res = self.get(url).await?;
        res.text()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }

    async fn fetch_blob(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let url = Url::parse(url).map_err(|err| FetchError::Transport(err.to_string()))?;
        let res = self.get(url).await?;
        let bytes = res
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Retry and pacing knobs, taken from `app.*` config.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub pause: Duration,
    pub max_retries: u32,
    pub retry_budget: Duration,
}

/// One message parsed out of a preview page, before media staging.
#[derive(Debug, Clone)]
struct PageMessage {
    message_id: i64,
    published_at: Option<DateTime<Utc>>,
    text: String,
    photo_urls: Vec<String>,
    video_urls: Vec<String>,
}

pub struct ChannelFetcher<'a, C: ChannelClient> {
    client: &'a C,
    cfg: FetchConfig,
    channel: String,
    staging_dir: PathBuf,
}

impl<'a, C: ChannelClient> ChannelFetcher<'a, C> {
    pub fn new(client: &'a C, cfg: FetchConfig, channel: &str, data_dir: &str) -> Self {
        let staging_dir = PathBuf::from(data_dir).join("staging").join(channel);
        Self {
            client,
            cfg,
            channel: channel.to_string(),
            staging_dir,
        }
    }

    /// Lazy, newest-first sequence of raw messages.
    ///
    /// With `since`, walks backwards until a message id at or below the
    /// checkpoint is reached (or the channel is exhausted); without it the
    /// sequence is bounded by `limit`. Fatal fetch failures surface as
    /// `SourceUnavailable`; a single message whose media cannot be staged
    /// surfaces as a per-record `MalformedRecord` item.
    pub fn stream(
        &self,
        limit: usize,
        since: Option<i64>,
    ) -> impl Stream<Item = Result<TelegramRaw, PipelineError>> + '_ {
        struct State {
            before: Option<i64>,
            yielded: usize,
            page: VecDeque<PageMessage>,
            exhausted: bool,
            first_page: bool,
        }

        let init = State {
            before: None,
            yielded: 0,
            page: VecDeque::new(),
            exhausted: false,
            first_page: true,
        };

        stream::unfold((self, init), move |(this, mut st)| async move {
            loop {
                if let Some(msg) = st.page.pop_front() {
                    st.yielded += 1;
                    let item = this.stage(msg).await;
                    return Some((item, (this, st)));
                }
                if st.exhausted {
                    return None;
                }

                // Sole rate-limit point for this source.
                if !st.first_page {
                    sleep(this.cfg.pause).await;
                }
                st.first_page = false;

                let html = match this.fetch_page_with_retry(st.before).await {
                    Ok(html) => html,
                    Err(err) => {
                        st.exhausted = true;
                        return Some((Err(err), (this, st)));
                    }
                };

                let mut messages = parse_page(&html);
                if messages.is_empty() {
                    st.exhausted = true;
                    continue;
                }
                st.before = messages.iter().map(|m| m.message_id).min();
                // Page order is oldest-first; the pipeline wants newest-first.
                messages.reverse();

                for msg in messages {
                    if let Some(checkpoint) = since {
                        if msg.message_id <= checkpoint {
                            st.exhausted = true;
                            break;
                        }
                    } else if st.yielded + st.page.len() >= limit {
                        st.exhausted = true;
                        break;
                    }
                    st.page.push_back(msg);
                }
            }
        })
    }

    async fn fetch_page_with_retry(&self, before: Option<i64>) -> Result<String, PipelineError> {
        self.retry(|| self.client.fetch_page(&self.channel, before))
            .await
            .map_err(|err| {
                PipelineError::SourceUnavailable(format!(
                    "channel {} page fetch failed: {err}",
                    self.channel
                ))
            })
    }

    /// Download and checksum every blob of a message, then emit the raw
    /// record. Any blob failure after retries fails this record only.
    async fn stage(&self, msg: PageMessage) -> Result<TelegramRaw, PipelineError> {
        let mut blobs = Vec::new();
        let media = msg
            .photo_urls
            .iter()
            .map(|u| (MediaKind::Image, u))
            .chain(msg.video_urls.iter().map(|u| (MediaKind::Video, u)));

        for (idx, (kind, url)) in media.enumerate() {
            let bytes = self
                .retry(|| self.client.fetch_blob(url))
                .await
                .map_err(|err| PipelineError::MalformedRecord {
                    external_id: Some(msg.message_id.to_string()),
                    reason: format!("media unreachable: {err}"),
                })?;

            let checksum = hex::encode(Sha256::digest(&bytes));
            let ext = blob_extension(url, kind);
            let path = self
                .staging_dir
                .join(format!("{}_{idx}.{ext}", msg.message_id));
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;
            }
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;

            blobs.push(StagedBlob {
                kind,
                origin_url: url.clone(),
                path: path.to_string_lossy().into_owned(),
                checksum,
            });
        }

        Ok(TelegramRaw {
            message_id: msg.message_id,
            published_at: msg.published_at,
            text: msg.text,
            blobs,
        })
    }

    /// Bounded retry with exponential backoff. Non-transient errors fail
    /// immediately; transient ones are retried until the attempt count or
    /// the elapsed-time budget runs out.
    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.cfg.max_retries || started.elapsed() >= self.cfg.retry_budget
                    {
                        return Err(err);
                    }
                    // Doubling from 4s, capped at 60s.
                    let secs = (2_u64 << attempt.min(10)).min(60);
                    warn!(%err, attempt, backoff_secs = secs, "transient fetch failure");
                    sleep(Duration::from_secs(secs)).await;
                }
            }
        }
    }
}

static MESSAGE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.tgme_widget_message").unwrap());
static TEXT_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".tgme_widget_message_text").unwrap());
static TIME_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".tgme_widget_message_date time").unwrap());
static PHOTO_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a.tgme_widget_message_photo_wrap").unwrap());
static VIDEO_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("video").unwrap());

static BG_IMAGE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"background-image:\s*url\('([^']+)'\)").unwrap());
static BR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Extract messages from one preview page, in document (oldest-first) order.
/// Entries without a parseable `data-post` id are ignored; service messages
/// on the preview have none.
fn parse_page(html: &str) -> Vec<PageMessage> {
    let doc = Html::parse_document(html);
    let mut out = Vec::new();

    for node in doc.select(&MESSAGE_SEL) {
        let Some(message_id) = node
            .value()
            .attr("data-post")
            .and_then(|p| p.rsplit('/').next())
            .and_then(|id| id.parse::<i64>().ok())
        else {
            continue;
        };

        let text = node
            .select(&TEXT_SEL)
            .next()
            .map(|el| html_to_text(&el.inner_html()))
            .unwrap_or_default();

        let published_at = node
            .select(&TIME_SEL)
            .next()
            .and_then(|el| el.value().attr("datetime"))
            .and_then(|dt| DateTime::parse_from_rfc3339(dt).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let photo_urls = node
            .select(&PHOTO_SEL)
            .filter_map(|el| el.value().attr("style"))
            .filter_map(|style| {
                BG_IMAGE_URL
                    .captures(style)
                    .map(|c| c[1].to_string())
            })
            .collect();

        let video_urls = node
            .select(&VIDEO_SEL)
            .filter_map(|el| el.value().attr("src"))
            .map(String::from)
            .collect();

        out.push(PageMessage {
            message_id,
            published_at,
            text,
            photo_urls,
            video_urls,
        });
    }

    out
}

/// Flatten a message-text fragment: `<br>` becomes a newline, other tags are
/// dropped, the handful of entities the preview emits are decoded.
fn html_to_text(fragment: &str) -> String {
    let s = BR_TAG.replace_all(fragment, "\n");
    let s = ANY_TAG.replace_all(&s, "");
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}

fn blob_extension(url: &str, kind: MediaKind) -> String {
    url.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.split('?').next().unwrap_or(ext).to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 4)
        .unwrap_or_else(|| match kind {
            MediaKind::Image => "jpg".to_string(),
            MediaKind::Video => "mp4".to_string(),
            MediaKind::File => "bin".to_string(),
        })
}
