//! HTTP fetch utilities and the PostgREST upsert client for revfeed.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "revfeed-storage";

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` leaves the transport default in place.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-attempt text fetcher. Callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
        })
    }

    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(query);
        Self::send(request)
            .instrument(info_span!("http_fetch", method = "GET", url))
            .await
    }

    pub async fn post_form_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).query(query).form(form);
        Self::send(request)
            .instrument(info_span!("http_fetch", method = "POST", url))
            .await
    }

    async fn send(request: reqwest::RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(status = status.as_u16(), %final_url, "response received");

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.text().await?;
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store rejected upsert into {table} with status {status}: {body}")]
    Rejected {
        table: String,
        status: u16,
        body: String,
    },
    #[error("invalid store credential header: {0}")]
    InvalidCredential(#[from] reqwest::header::InvalidHeaderValue),
}

/// Minimal PostgREST client speaking the Supabase REST dialect.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            base_url: base_url.into(),
            service_key: service_key.into(),
        })
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url.trim_end_matches('/'), table)
    }

    pub fn upsert_headers(&self) -> Result<HeaderMap, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(&self.service_key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.service_key))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "prefer",
            HeaderValue::from_static("resolution=merge-duplicates,return=minimal"),
        );
        Ok(headers)
    }

    /// Insert-or-overwrite `rows` into `table`, resolving conflicts on `conflict_columns`.
    pub async fn upsert<T: Serialize + Sync>(
        &self,
        table: &str,
        conflict_columns: &[&str],
        rows: &[T],
    ) -> Result<(), StoreError> {
        let request = self.upsert_request(table, conflict_columns, rows)?;
        let span = info_span!("store_upsert", table, rows = rows.len());
        self.send_upsert(table, request).instrument(span).await
    }

    /// Build the upsert request: JSON row array, `on_conflict` naming the natural key.
    pub fn upsert_request<T: Serialize>(
        &self,
        table: &str,
        conflict_columns: &[&str],
        rows: &[T],
    ) -> Result<reqwest::Request, StoreError> {
        let on_conflict = conflict_columns.join(",");
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", on_conflict.as_str())])
            .headers(self.upsert_headers()?)
            .json(rows)
            .build()?;
        Ok(request)
    }

    async fn send_upsert(&self, table: &str, request: reqwest::Request) -> Result<(), StoreError> {
        let resp = self.client.execute(request).await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            table: table.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    fn store(base: &str) -> RestStore {
        RestStore::new(base, "service-key", HttpClientConfig::default()).expect("store")
    }

    #[test]
    fn table_url_tolerates_trailing_slash() {
        assert_eq!(
            store("https://abc.supabase.co/").table_url("raw_reviews"),
            "https://abc.supabase.co/rest/v1/raw_reviews"
        );
        assert_eq!(
            store("https://abc.supabase.co").table_url("raw_reviews"),
            "https://abc.supabase.co/rest/v1/raw_reviews"
        );
    }

    #[test]
    fn upsert_headers_carry_key_and_merge_preference() {
        let headers = store("https://abc.supabase.co").upsert_headers().expect("headers");
        assert_eq!(headers.get("apikey").unwrap(), "service-key");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer service-key");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(
            headers.get("prefer").unwrap(),
            "resolution=merge-duplicates,return=minimal"
        );
    }

    #[test]
    fn upsert_request_targets_natural_key_with_row_array_body() {
        let rows = vec![
            json!({"source": "google_play", "review_id": "gp:1"}),
            json!({"source": "google_play", "review_id": "gp:2"}),
        ];
        let request = store("https://abc.supabase.co/")
            .upsert_request("raw_reviews", &["source", "review_id"], &rows)
            .expect("request");

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/rest/v1/raw_reviews");
        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![("on_conflict".to_string(), "source,review_id".to_string())]
        );
        assert_eq!(
            request.headers().get("prefer").unwrap(),
            "resolution=merge-duplicates,return=minimal"
        );

        let body = request.body().and_then(|b| b.as_bytes()).expect("buffered body");
        let sent: JsonValue = serde_json::from_slice(body).expect("json body");
        assert_eq!(sent, JsonValue::Array(rows));
    }

    #[test]
    fn credential_with_newline_is_rejected() {
        let bad = RestStore::new("https://abc.supabase.co", "key\nwith-newline", HttpClientConfig::default())
            .expect("store");
        assert!(matches!(
            bad.upsert_headers(),
            Err(StoreError::InvalidCredential(_))
        ));
    }

    #[test]
    fn fetch_error_renders_status_and_url() {
        let err = FetchError::HttpStatus {
            status: 429,
            url: "https://play.google.com/store/search".into(),
        };
        assert_eq!(
            err.to_string(),
            "http status 429 for https://play.google.com/store/search"
        );
    }
}
