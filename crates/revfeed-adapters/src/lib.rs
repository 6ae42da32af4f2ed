//! Review feed contract + the Google Play feed implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use revfeed_core::{RawReview, ReviewPage, ReviewTimestamp, SOURCE_GOOGLE_PLAY};
use reqwest::Url;
use revfeed_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "revfeed-adapters";

pub const GOOGLE_PLAY_BATCHEXECUTE_URL: &str =
    "https://play.google.com/_/PlayStoreUi/data/batchexecute";
pub const GOOGLE_PLAY_SEARCH_URL: &str = "https://play.google.com/store/search";

const REVIEWS_RPC_ID: &str = "UsvDTd";
const SORT_NEWEST: u8 = 2;
const XSSI_PREFIX: &str = ")]}'";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feed payload: {0}")]
    Malformed(String),
    #[error("feed payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parameters of one review page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery<'a> {
    pub app_id: &'a str,
    pub lang: &'a str,
    /// `None` queries the global (region-unscoped) store.
    pub country: Option<&'a str>,
    pub cursor: Option<&'a str>,
    pub count: usize,
}

#[async_trait]
pub trait ReviewFeed: Send + Sync {
    fn source(&self) -> &'static str;

    async fn fetch_page(&self, query: PageQuery<'_>) -> Result<ReviewPage, FeedError>;

    async fn search_apps(
        &self,
        query: &str,
        lang: &str,
        country: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct GooglePlayFeed {
    http: HttpFetcher,
}

impl GooglePlayFeed {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ReviewFeed for GooglePlayFeed {
    fn source(&self) -> &'static str {
        SOURCE_GOOGLE_PLAY
    }

    async fn fetch_page(&self, query: PageQuery<'_>) -> Result<ReviewPage, FeedError> {
        let body = reviews_request_body(&query);
        let params = locale_params(query.lang, query.country);
        let resp = self
            .http
            .post_form_text(GOOGLE_PLAY_BATCHEXECUTE_URL, &params, &[("f.req", body.as_str())])
            .await?;
        let page = parse_reviews_response(&resp.body)?;
        debug!(
            app_id = query.app_id,
            reviews = page.reviews.len(),
            has_cursor = page.next_cursor.is_some(),
            "decoded review page"
        );
        Ok(page)
    }

    async fn search_apps(
        &self,
        query: &str,
        lang: &str,
        country: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, FeedError> {
        let mut params = vec![("q", query), ("c", "apps")];
        params.extend(locale_params(lang, country));
        let resp = self.http.get_text(GOOGLE_PLAY_SEARCH_URL, &params).await?;
        parse_search_results(&resp.body, limit)
    }
}

pub fn feed_for_source(source: &str, http: HttpFetcher) -> Option<Box<dyn ReviewFeed>> {
    match source {
        SOURCE_GOOGLE_PLAY => Some(Box::new(GooglePlayFeed::new(http))),
        _ => None,
    }
}

fn locale_params<'a>(lang: &'a str, country: Option<&'a str>) -> Vec<(&'static str, &'a str)> {
    let mut params = vec![("hl", lang)];
    if let Some(country) = country {
        params.push(("gl", country));
    }
    params
}

/// Build the `f.req` form value for the reviews RPC.
pub fn reviews_request_body(query: &PageQuery<'_>) -> String {
    let inner = json!([
        null,
        null,
        [2, SORT_NEWEST, [query.count, null, query.cursor], null, []],
        [query.app_id, 7]
    ]);
    json!([[[REVIEWS_RPC_ID, inner.to_string(), null, "generic"]]]).to_string()
}

fn json_at<'a>(value: &'a JsonValue, path: &[usize]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for index in path {
        cur = cur.get(*index)?;
    }
    Some(cur)
}

fn json_str_at(value: &JsonValue, path: &[usize]) -> Option<String> {
    json_at(value, path)?.as_str().map(ToString::to_string)
}

fn epoch_at(value: &JsonValue, path: &[usize]) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(json_at(value, path)?.as_i64()?, 0)
}

/// Decode a `batchexecute` reviews response into a page.
///
/// An RPC entry without a payload is how the feed reports "no reviews", so it
/// decodes to an empty final page rather than an error.
pub fn parse_reviews_response(body: &str) -> Result<ReviewPage, FeedError> {
    let trimmed = body.trim_start();
    let json_text = trimmed.strip_prefix(XSSI_PREFIX).unwrap_or(trimmed);
    let envelope: JsonValue = serde_json::from_str(json_text.trim_start())?;
    let entries = envelope
        .as_array()
        .ok_or_else(|| FeedError::Malformed("response envelope is not an array".into()))?;

    let entry = entries
        .iter()
        .find(|e| e.get(0).and_then(JsonValue::as_str) == Some("wrb.fr"))
        .ok_or_else(|| FeedError::Malformed("no wrb.fr entry in response".into()))?;

    let Some(payload) = entry.get(2).and_then(JsonValue::as_str) else {
        return Ok(ReviewPage::default());
    };
    let inner: JsonValue = serde_json::from_str(payload)?;

    let reviews = inner
        .get(0)
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().filter_map(decode_review).collect())
        .unwrap_or_default();

    let next_cursor = inner
        .as_array()
        .filter(|items| items.len() >= 2)
        .and_then(|items| items[items.len() - 2].as_array())
        .and_then(|tail| tail.last())
        .and_then(JsonValue::as_str)
        .map(ToString::to_string);

    Ok(ReviewPage {
        reviews,
        next_cursor,
    })
}

fn decode_review(item: &JsonValue) -> Option<RawReview> {
    item.as_array()?;

    let mut extra = Map::new();
    if let Some(image) = json_str_at(item, &[1, 1, 3, 2]) {
        extra.insert("userImage".into(), JsonValue::String(image));
    }
    if let Some(reply) = json_str_at(item, &[7, 1]) {
        extra.insert("replyContent".into(), JsonValue::String(reply));
    }
    if let Some(replied_at) = epoch_at(item, &[7, 2, 0]) {
        let replied_at = replied_at.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        extra.insert("repliedAt".into(), JsonValue::String(replied_at));
    }
    if let Some(version) = json_str_at(item, &[10]) {
        extra.insert("reviewCreatedVersion".into(), JsonValue::String(version.clone()));
        extra.insert("appVersion".into(), JsonValue::String(version));
    }

    Some(RawReview {
        review_id: json_str_at(item, &[0]),
        user_name: json_str_at(item, &[1, 0]),
        score: match json_at(item, &[2]) {
            Some(JsonValue::Number(n)) => Some(n.clone()),
            _ => None,
        },
        title: None,
        content: json_str_at(item, &[4]),
        at: epoch_at(item, &[5, 0]).map(ReviewTimestamp::At),
        thumbs_up_count: json_at(item, &[6]).and_then(JsonValue::as_i64),
        extra,
    })
}

/// Extract up to `limit` distinct application ids from a store search page, in document order.
pub fn parse_search_results(html: &str, limit: usize) -> Result<Vec<String>, FeedError> {
    let base = Url::parse(GOOGLE_PLAY_SEARCH_URL).map_err(|e| FeedError::Malformed(e.to_string()))?;
    let document = Html::parse_document(html);
    let sel = Selector::parse(r#"a[href*="/store/apps/details?id="]"#)
        .map_err(|e| FeedError::Malformed(e.to_string()))?;

    let mut app_ids = Vec::new();
    for node in document.select(&sel) {
        if app_ids.len() >= limit {
            break;
        }
        let Some(href) = node.value().attr("href") else {
            continue;
        };
        let Some(app_id) = app_id_from_details_href(&base, href) else {
            continue;
        };
        if !app_ids.contains(&app_id) {
            app_ids.push(app_id);
        }
    }
    Ok(app_ids)
}

/// Resolve a (possibly relative) details link and read its decoded `id` parameter.
fn app_id_from_details_href(base: &Url, href: &str) -> Option<String> {
    let url = base.join(href).ok()?;
    let (_, id) = url.query_pairs().find(|(key, _)| key == "id")?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn first_page_body_sends_null_cursor() {
        let body = reviews_request_body(&PageQuery {
            app_id: "com.tonik.mobile",
            lang: "en",
            country: Some("ph"),
            cursor: None,
            count: 200,
        });
        let outer: JsonValue = serde_json::from_str(&body).unwrap();
        assert_eq!(outer[0][0][0], "UsvDTd");
        assert_eq!(outer[0][0][3], "generic");
        let inner: JsonValue = serde_json::from_str(outer[0][0][1].as_str().unwrap()).unwrap();
        assert_eq!(inner, json!([null, null, [2, 2, [200, null, null], null, []], ["com.tonik.mobile", 7]]));
    }

    #[test]
    fn continuation_body_carries_cursor() {
        let body = reviews_request_body(&PageQuery {
            app_id: "x.y.z",
            lang: "en",
            country: None,
            cursor: Some("CsYBtoken"),
            count: 200,
        });
        let outer: JsonValue = serde_json::from_str(&body).unwrap();
        let inner: JsonValue = serde_json::from_str(outer[0][0][1].as_str().unwrap()).unwrap();
        assert_eq!(inner[2][2], json!([200, null, "CsYBtoken"]));
        assert_eq!(inner[3][0], "x.y.z");
    }

    #[test]
    fn locale_params_omit_region_for_global_queries() {
        assert_eq!(locale_params("en", Some("ph")), vec![("hl", "en"), ("gl", "ph")]);
        assert_eq!(locale_params("en", None), vec![("hl", "en")]);
    }

    #[test]
    fn decodes_review_positions() {
        let item = json!([
            "gp:AOqpTOE1",
            ["Juan Dela Cruz", [null, 2, null, [null, null, "https://img.example/u.png"]]],
            5,
            null,
            "Fast transfers",
            [1714550400, 123000000],
            7,
            [null, "Thanks Juan!", [1714636800, 0]],
            null,
            null,
            "3.4.1"
        ]);
        let review = decode_review(&item).unwrap();
        assert_eq!(review.review_id.as_deref(), Some("gp:AOqpTOE1"));
        assert_eq!(review.user_name.as_deref(), Some("Juan Dela Cruz"));
        assert_eq!(review.score.as_ref().and_then(|n| n.as_i64()), Some(5));
        assert_eq!(review.content.as_deref(), Some("Fast transfers"));
        assert_eq!(review.thumbs_up_count, Some(7));
        assert_eq!(
            review.at,
            Some(ReviewTimestamp::At(
                Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap()
            ))
        );
        assert_eq!(review.extra_str("userImage"), Some("https://img.example/u.png"));
        assert_eq!(review.extra_str("replyContent"), Some("Thanks Juan!"));
        assert_eq!(review.extra_str("repliedAt"), Some("2024-05-02T08:00:00Z"));
        assert_eq!(review.extra_str("appVersion"), Some("3.4.1"));
    }

    #[test]
    fn non_array_review_items_are_skipped() {
        assert!(decode_review(&json!("noise")).is_none());
    }

    #[test]
    fn app_id_is_read_from_details_link() {
        let base = Url::parse(GOOGLE_PLAY_SEARCH_URL).unwrap();
        assert_eq!(
            app_id_from_details_href(&base, "/store/apps/details?id=com.tonik.mobile&hl=en"),
            Some("com.tonik.mobile".to_string())
        );
        assert_eq!(
            app_id_from_details_href(&base, "https://play.google.com/store/apps/details?hl=en&id=ph.com.gotyme"),
            Some("ph.com.gotyme".to_string())
        );
        assert_eq!(app_id_from_details_href(&base, "/store/apps/details?id="), None);
        assert_eq!(app_id_from_details_href(&base, "/store/apps/details"), None);
    }

    #[test]
    fn percent_encoded_app_id_is_decoded() {
        let base = Url::parse(GOOGLE_PLAY_SEARCH_URL).unwrap();
        assert_eq!(
            app_id_from_details_href(&base, "/store/apps/details?id=com%2Etonik%2Emobile"),
            Some("com.tonik.mobile".to_string())
        );
    }
}
