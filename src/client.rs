//! Remote open-data client.
//!
//! Issues Socrata-style queries (`$where`, `$order`, `$limit`) against the
//! records and permits resources. The client is consumed through the
//! [`RecordFetcher`] trait so the pipeline can run against an in-memory
//! fetcher in tests.
//!
//! Responses are cached by the injected [`ResponseCache`]; the client only
//! consults and fills it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use permit_leads_core::models::RawRecord;
use reqwest::Url;

use crate::cache::ResponseCache;
use crate::config::ApiConfig;

/// Failure to retrieve a batch of records.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid request URL '{url}': {message}")]
    Url { url: String, message: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// A single bounded query against one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Resource path relative to the API base URL, e.g. `/mkgf-zjhb.json`.
    pub endpoint: String,
    pub filter: Option<String>,
    /// Field the look-back window applies to.
    pub date_field: Option<String>,
    /// Look-back window in days; `0` for none.
    pub days: u32,
    /// Sort field; results are always descending.
    pub order_by: String,
    pub limit: u32,
}

impl FetchRequest {
    /// The `$where` expression: the filter ANDed with the date window.
    pub fn where_clause(&self, today: NaiveDate) -> Option<String> {
        let filter = self
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        let window = match (&self.date_field, self.days) {
            (Some(field), days) if days > 0 => {
                let since = today - chrono::Duration::days(i64::from(days));
                Some(format!("{} >= '{}'", field, since.format("%Y-%m-%d")))
            }
            _ => None,
        };
        match (filter, window) {
            (Some(f), Some(w)) => Some(format!("({}) AND {}", f, w)),
            (Some(f), None) => Some(f.to_string()),
            (None, Some(w)) => Some(w),
            (None, None) => None,
        }
    }

    pub fn query_params(&self, today: NaiveDate) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(3);
        if let Some(clause) = self.where_clause(today) {
            params.push(("$where", clause));
        }
        params.push(("$order", format!("{} DESC", self.order_by)));
        params.push(("$limit", self.limit.to_string()));
        params
    }
}

/// The "fetch records matching a filter" contract.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest, today: NaiveDate)
        -> Result<Vec<RawRecord>, FetchError>;

    /// Entries currently held in the response cache, if there is one.
    fn cached_responses(&self) -> usize {
        0
    }
}

/// HTTP client for a Socrata open-data API.
pub struct SodaClient {
    http: reqwest::Client,
    base_url: String,
    app_token: Option<String>,
    cache: Arc<dyn ResponseCache>,
}

impl SodaClient {
    pub fn new(config: &ApiConfig, cache: Arc<dyn ResponseCache>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_token: config.app_token.clone().filter(|t| !t.is_empty()),
            cache,
        })
    }

    /// Full request URL with the encoded query string.
    pub fn url(&self, request: &FetchRequest, today: NaiveDate) -> Result<Url, FetchError> {
        let raw = format!(
            "{}/{}",
            self.base_url,
            request.endpoint.trim_start_matches('/')
        );
        Url::parse_with_params(&raw, request.query_params(today)).map_err(|e| FetchError::Url {
            url: raw,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RecordFetcher for SodaClient {
    async fn fetch(
        &self,
        request: &FetchRequest,
        today: NaiveDate,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let url = self.url(request, today)?;
        let key = url.as_str().to_string();

        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(url = %truncate(&key, 256), "response cache hit");
            return Ok((*hit).clone());
        }

        tracing::debug!(url = %truncate(&key, 256), "requesting");
        let mut builder = self.http.get(url);
        if let Some(token) = &self.app_token {
            builder = builder.header("X-App-Token", token);
        }

        let resp = builder.send().await.map_err(|e| FetchError::Transport {
            url: truncate(&key, 256),
            source: e,
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: truncate(&key, 256),
                status: status.as_u16(),
            });
        }

        let records: Vec<RawRecord> = resp.json().await.map_err(|e| FetchError::Decode {
            url: truncate(&key, 256),
            message: e.to_string(),
        })?;

        self.cache.put(&key, Arc::new(records.clone()));
        Ok(records)
    }

    fn cached_responses(&self) -> usize {
        self.cache.len()
    }
}

/// Shorten `s` to at most `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
