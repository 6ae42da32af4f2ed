//! Core review model shared by the feed adapters and the collect pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};

pub const CRATE_NAME: &str = "revfeed-core";

/// Source tag written into every canonical row produced from the Google Play feed.
pub const SOURCE_GOOGLE_PLAY: &str = "google_play";

/// Destination table for canonical rows.
pub const RAW_REVIEWS_TABLE: &str = "raw_reviews";

/// Natural key columns used for conflict resolution on upsert.
pub const NATURAL_KEY_COLUMNS: [&str; 2] = ["source", "review_id"];

/// Review timestamp as handed over by the feed.
///
/// Adapters that decode epochs produce `At`; records that arrive as loose JSON
/// may carry arbitrary text, which is only interpreted during normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReviewTimestamp {
    At(DateTime<Utc>),
    Text(String),
}

/// Review record in the shape owned by the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawReview {
    #[serde(rename = "reviewId", default)]
    pub review_id: Option<String>,
    #[serde(rename = "userName", default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub score: Option<Number>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub at: Option<ReviewTimestamp>,
    #[serde(rename = "thumbsUpCount", default)]
    pub thumbs_up_count: Option<i64>,
    /// Everything else the feed returned, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl RawReview {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(JsonValue::as_str)
    }

    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(JsonValue::as_i64)
    }
}

/// One page of a cursor-paginated review query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReviewPage {
    pub reviews: Vec<RawReview>,
    pub next_cursor: Option<String>,
}

/// Canonical persisted review row. Field names match the `raw_reviews` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReviewRow {
    pub source: String,
    pub platform_app_id: String,
    pub review_id: String,
    pub author_name: Option<String>,
    pub author_hash: String,
    pub rating: Option<Number>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub posted_at: Option<String>,
    pub thumbs_up: u64,
    pub data: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn raw_review_keeps_unknown_keys_in_extra() {
        let raw: RawReview = serde_json::from_value(json!({
            "reviewId": "gp:1",
            "userName": "Ana",
            "score": 4,
            "text": "legacy body",
            "thumbsUp": 3,
            "at": "2024-05-01T08:00:00Z"
        }))
        .unwrap();

        assert_eq!(raw.review_id.as_deref(), Some("gp:1"));
        assert_eq!(raw.score, Some(Number::from(4)));
        assert_eq!(raw.content, None);
        assert_eq!(raw.extra_str("text"), Some("legacy body"));
        assert_eq!(raw.extra_i64("thumbsUp"), Some(3));
        assert!(!raw.extra.contains_key("reviewId"));
        assert_eq!(
            raw.at,
            Some(ReviewTimestamp::At(
                Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).single().unwrap()
            ))
        );
    }

    #[test]
    fn loose_timestamp_text_stays_text() {
        let raw: RawReview = serde_json::from_value(json!({
            "reviewId": "gp:2",
            "at": "last tuesday"
        }))
        .unwrap();
        assert_eq!(raw.at, Some(ReviewTimestamp::Text("last tuesday".into())));
    }

    #[test]
    fn structured_timestamp_serializes_as_text() {
        let raw = RawReview {
            review_id: Some("gp:3".into()),
            at: Some(ReviewTimestamp::At(
                Utc.with_ymd_and_hms(2023, 1, 2, 3, 4, 5).single().unwrap(),
            )),
            ..Default::default()
        };
        let value = serde_json::to_value(&raw).unwrap();
        assert_eq!(value["at"], json!("2023-01-02T03:04:05Z"));
        assert_eq!(value["reviewId"], json!("gp:3"));
    }
}
