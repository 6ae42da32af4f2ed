//! Collect pipeline: fetch with fallback, normalize, then upsert in batches.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use revfeed_adapters::{feed_for_source, PageQuery, ReviewFeed};
use revfeed_core::{
    CanonicalReviewRow, RawReview, ReviewTimestamp, NATURAL_KEY_COLUMNS, RAW_REVIEWS_TABLE,
    SOURCE_GOOGLE_PLAY,
};
use revfeed_storage::{HttpClientConfig, HttpFetcher, RestStore, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "revfeed-sync";

pub const PAGE_SIZE: usize = 200;
pub const SEARCH_CANDIDATES: usize = 5;
pub const UPSERT_BATCH_SIZE: usize = 500;

/// Defaults for every optional setting. Endpoint and credential have none.
pub const CONFIG_DEFAULTS: &[(&str, &str)] = &[
    ("GP_APP_ID", "com.tonik.mobile"),
    ("GP_APP_QUERY", "Tonik Digital Bank"),
    ("GP_COUNTRY", "ph"),
    ("GP_LANG", "en"),
    ("GP_MAX_REVIEWS", "1200"),
    ("REVFEED_USER_AGENT", "revfeed-bot/0.1"),
];

const CREDENTIAL_KEYS: [&str; 2] = ["SERVICE_ROLE_KEY", "SUPABASE_SERVICE_ROLE_KEY"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing SUPABASE_URL")]
    MissingEndpoint,
    #[error("missing SERVICE_ROLE_KEY (or SUPABASE_SERVICE_ROLE_KEY)")]
    MissingCredential,
    #[error("{key} must be an unsigned integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub supabase_url: String,
    pub service_role_key: String,
    pub app_id: String,
    pub app_query: String,
    pub country: String,
    pub lang: String,
    pub max_reviews: usize,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
}

impl fmt::Debug for CollectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorConfig")
            .field("supabase_url", &self.supabase_url)
            .field("service_role_key", &"<redacted>")
            .field("app_id", &self.app_id)
            .field("app_query", &self.app_query)
            .field("country", &self.country)
            .field("lang", &self.lang)
            .field("max_reviews", &self.max_reviews)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let setting = |key: &str| {
            get(key).unwrap_or_else(|| {
                CONFIG_DEFAULTS
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default()
            })
        };

        let supabase_url = get("SUPABASE_URL").ok_or(ConfigError::MissingEndpoint)?;
        let service_role_key = CREDENTIAL_KEYS
            .iter()
            .find_map(|key| get(*key))
            .ok_or(ConfigError::MissingCredential)?;

        let max_reviews = parse_unsigned("GP_MAX_REVIEWS", &setting("GP_MAX_REVIEWS"))?;
        let http_timeout_secs = get("REVFEED_HTTP_TIMEOUT_SECS")
            .map(|v| parse_unsigned("REVFEED_HTTP_TIMEOUT_SECS", &v))
            .transpose()?;

        Ok(Self {
            supabase_url,
            service_role_key,
            app_id: setting("GP_APP_ID"),
            app_query: setting("GP_APP_QUERY"),
            country: setting("GP_COUNTRY"),
            lang: setting("GP_LANG"),
            max_reviews: max_reviews as usize,
            user_agent: setting("REVFEED_USER_AGENT"),
            http_timeout_secs,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_unsigned(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}

/// Which fallback step produced the reviews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchStrategy {
    Regional,
    Global,
    SearchCandidate { query: String, rank: usize },
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Effective application id for downstream rows.
    pub app_id: String,
    pub strategy: FetchStrategy,
    pub reviews: Vec<RawReview>,
}

/// Page through the feed until the cursor runs out or `max_count` is reached.
///
/// A failed page ends pagination for this scope; whatever was accumulated is returned.
pub async fn fetch_reviews(
    feed: &dyn ReviewFeed,
    app_id: &str,
    lang: &str,
    country: Option<&str>,
    max_count: usize,
) -> Vec<RawReview> {
    let mut acc: Vec<RawReview> = Vec::new();
    let mut cursor: Option<String> = None;

    while acc.len() < max_count {
        let query = PageQuery {
            app_id,
            lang,
            country,
            cursor: cursor.as_deref(),
            count: PAGE_SIZE,
        };
        let page = match feed.fetch_page(query).await {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    app_id,
                    country = country.unwrap_or("global"),
                    error = %err,
                    "reviews fetch error"
                );
                break;
            }
        };
        if page.reviews.is_empty() {
            break;
        }
        acc.extend(page.reviews);
        match page.next_cursor.filter(|c| !c.is_empty()) {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    acc.truncate(max_count);
    acc
}

/// Regional fetch, then global, then search-discovered candidates; first non-empty wins.
pub async fn resolve_reviews(feed: &dyn ReviewFeed, config: &CollectorConfig) -> FetchOutcome {
    let lang = config.lang.as_str();
    let country = Some(config.country.as_str());
    let max = config.max_reviews;

    let reviews = fetch_reviews(feed, &config.app_id, lang, country, max).await;
    if !reviews.is_empty() {
        return FetchOutcome {
            app_id: config.app_id.clone(),
            strategy: FetchStrategy::Regional,
            reviews,
        };
    }

    info!("no results with region filter, retrying global store");
    let reviews = fetch_reviews(feed, &config.app_id, lang, None, max).await;
    if !reviews.is_empty() {
        return FetchOutcome {
            app_id: config.app_id.clone(),
            strategy: FetchStrategy::Global,
            reviews,
        };
    }

    info!(query = %config.app_query, "searching for app by query");
    let candidates = match feed
        .search_apps(&config.app_query, lang, country, SEARCH_CANDIDATES)
        .await
    {
        Ok(candidates) => candidates,
        Err(err) => {
            warn!(error = %err, "search failed");
            Vec::new()
        }
    };

    for (rank, candidate) in candidates.iter().enumerate() {
        if candidate.trim().is_empty() {
            continue;
        }
        info!(candidate = %candidate, "trying candidate app id");
        let mut reviews = fetch_reviews(feed, candidate, lang, country, max).await;
        if reviews.is_empty() {
            reviews = fetch_reviews(feed, candidate, lang, None, max).await;
        }
        if !reviews.is_empty() {
            return FetchOutcome {
                app_id: candidate.clone(),
                strategy: FetchStrategy::SearchCandidate {
                    query: config.app_query.clone(),
                    rank,
                },
                reviews,
            };
        }
    }

    FetchOutcome {
        app_id: config.app_id.clone(),
        strategy: FetchStrategy::Exhausted,
        reviews: Vec::new(),
    }
}

pub fn author_hash(author_name: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(author_name.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Interpret a feed timestamp. Naive values are taken as UTC, bare dates as midnight UTC.
pub fn parse_review_timestamp(at: &ReviewTimestamp) -> Option<DateTime<Utc>> {
    let text = match at {
        ReviewTimestamp::At(dt) => return Some(*dt),
        ReviewTimestamp::Text(text) => text.trim(),
    };
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn normalize_posted_at(review_id: &str, at: Option<&ReviewTimestamp>) -> Option<String> {
    let at = at?;
    match parse_review_timestamp(at) {
        Some(dt) => Some(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        None => {
            warn!(review_id, value = ?at, "unparseable review timestamp; posted_at left null");
            None
        }
    }
}

fn review_content(raw: &RawReview) -> Option<String> {
    raw.content
        .clone()
        .filter(|c| !c.is_empty())
        .or_else(|| raw.extra_str("text").map(ToString::to_string))
}

fn review_thumbs_up(raw: &RawReview) -> u64 {
    let count = raw
        .thumbs_up_count
        .filter(|n| *n != 0)
        .or_else(|| raw.extra_i64("thumbsUp"))
        .unwrap_or(0);
    count.max(0) as u64
}

/// Deduplicate by review id (first occurrence wins) and reshape into canonical rows.
///
/// Records without an id are dropped. Input order is the fetch order.
pub fn normalize_reviews(
    source: &str,
    app_id: &str,
    raws: &[RawReview],
) -> Result<Vec<CanonicalReviewRow>, serde_json::Error> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut rows = Vec::new();

    for raw in raws {
        let Some(review_id) = raw.review_id.as_deref().filter(|id| !id.is_empty()) else {
            continue;
        };
        if !seen.insert(review_id) {
            continue;
        }

        rows.push(CanonicalReviewRow {
            source: source.to_string(),
            platform_app_id: app_id.to_string(),
            review_id: review_id.to_string(),
            author_name: raw.user_name.clone(),
            author_hash: author_hash(raw.user_name.as_deref()),
            rating: raw.score.clone(),
            title: raw.title.clone(),
            content: review_content(raw),
            posted_at: normalize_posted_at(review_id, raw.at.as_ref()),
            thumbs_up: review_thumbs_up(raw),
            data: serde_json::to_value(raw)?,
        });
    }

    Ok(rows)
}

#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn upsert_batch(&self, rows: &[CanonicalReviewRow]) -> Result<(), StoreError>;
}

#[async_trait]
impl ReviewSink for RestStore {
    async fn upsert_batch(&self, rows: &[CanonicalReviewRow]) -> Result<(), StoreError> {
        self.upsert(RAW_REVIEWS_TABLE, &NATURAL_KEY_COLUMNS, rows).await
    }
}

#[derive(Debug, Error)]
#[error("upsert of batch {batch_index} failed after {rows_submitted} rows were submitted")]
pub struct LoadError {
    pub batch_index: usize,
    pub rows_submitted: usize,
    #[source]
    pub source: StoreError,
}

/// Upsert `rows` in order, `batch_size` at a time. Returns the number of rows submitted.
///
/// The first failing batch stops the load; earlier batches stay written.
pub async fn upsert_in_batches(
    sink: &dyn ReviewSink,
    rows: &[CanonicalReviewRow],
    batch_size: usize,
) -> Result<usize, LoadError> {
    let mut submitted = 0usize;
    for (batch_index, chunk) in rows.chunks(batch_size.max(1)).enumerate() {
        if let Err(source) = sink.upsert_batch(chunk).await {
            return Err(LoadError {
                batch_index,
                rows_submitted: submitted,
                source,
            });
        }
        submitted += chunk.len();
        info!(batch_index, rows = chunk.len(), submitted, "upserted batch");
    }
    Ok(submitted)
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub app_id: String,
    pub strategy: FetchStrategy,
    pub fetched_reviews: usize,
    pub unique_rows: usize,
    pub upserted_rows: usize,
    pub dry_run: bool,
}

pub struct CollectPipeline {
    config: CollectorConfig,
    feed: Box<dyn ReviewFeed>,
    sink: Box<dyn ReviewSink>,
    dry_run: bool,
}

impl CollectPipeline {
    pub fn new(config: CollectorConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let feed = feed_for_source(SOURCE_GOOGLE_PLAY, http)
            .with_context(|| format!("no feed registered for {SOURCE_GOOGLE_PLAY}"))?;
        let sink = RestStore::new(
            config.supabase_url.clone(),
            config.service_role_key.clone(),
            config.http_client_config(),
        )?;
        Ok(Self::with_components(config, feed, Box::new(sink)))
    }

    pub fn with_components(
        config: CollectorConfig,
        feed: Box<dyn ReviewFeed>,
        sink: Box<dyn ReviewSink>,
    ) -> Self {
        Self {
            config,
            feed,
            sink,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run_once(&self) -> Result<CollectRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("collect_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<CollectRunSummary> {
        let started_at = Utc::now();
        let config = &self.config;
        info!(
            app_id = %config.app_id,
            country = %config.country,
            lang = %config.lang,
            max = config.max_reviews,
            "fetching reviews"
        );

        let outcome = resolve_reviews(self.feed.as_ref(), config).await;
        info!(
            fetched = outcome.reviews.len(),
            app_id = %outcome.app_id,
            strategy = ?outcome.strategy,
            "fetched raw reviews"
        );

        let rows = normalize_reviews(self.feed.source(), &outcome.app_id, &outcome.reviews)
            .context("converting raw reviews into canonical rows")?;
        info!(rows = rows.len(), "prepared unique rows");

        let upserted_rows = if self.dry_run {
            info!(rows = rows.len(), "dry run; skipping upsert");
            0
        } else {
            match upsert_in_batches(self.sink.as_ref(), &rows, UPSERT_BATCH_SIZE).await {
                Ok(n) => n,
                Err(err) => {
                    return Err(err).context(format!("loading rows into {RAW_REVIEWS_TABLE}"));
                }
            }
        };
        if !self.dry_run {
            info!(upserted = upserted_rows, table = RAW_REVIEWS_TABLE, "ok: upserted rows");
        }

        Ok(CollectRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            app_id: outcome.app_id,
            strategy: outcome.strategy,
            fetched_reviews: outcome.reviews.len(),
            unique_rows: rows.len(),
            upserted_rows,
            dry_run: self.dry_run,
        })
    }
}

/// Validate configuration first, then run one collect pass.
///
/// A [`ConfigError`] is returned before any client is built or request sent.
pub async fn run_collect_once_from_env(dry_run: bool) -> Result<CollectRunSummary> {
    let config = CollectorConfig::from_env()?;
    let pipeline = CollectPipeline::new(config)?.with_dry_run(dry_run);
    pipeline.run_once().await
}
