//! Transport seam and rate-limited pagination client.
//!
//! The engine never talks to the network directly; it goes through the
//! narrow [`Transport`] trait so tests can substitute a scripted transport.
//! [`HttpTransport`] is the production implementation (reqwest, bearer auth,
//! per-request timeout).
//!
//! [`ApiClient`] layers the retry policy on top:
//!
//! - HTTP 429 → sleep for the server's `Retry-After`, or an exponential
//!   default starting at 1s, and retry up to the attempt bound.
//! - HTTP 5xx and network errors → exponential backoff with jitter, same
//!   bound.
//! - HTTP 401/403 → fail immediately as an authorization error.
//! - Other 4xx → fail immediately; a retry cannot make the request valid.
//!
//! Retries always reissue the identical request (reads are idempotent and
//! cursors are stable across a retried page request).
//!
//! Pagination is exposed as [`PageStream`]: a lazy, single-pass sequence of
//! pages with an explicit [`PageStream::next_page`] contract. One page is
//! buffered at a time and pages come back in server order. Once exhausted, a
//! stream cannot be rewound — cursors are server-side positions, not offsets.

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoints::{
    EndpointDefinition, PagingStyle, PAGE_MAX_SIZE, PAGE_WITH_HISTORY_MAX_SIZE,
};
use crate::error::{ExtractError, Result};

/// One object as returned by the API, untouched.
pub type RawRecord = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Raw response handed back by a [`Transport`]. Header names are lowercase.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl TransportResponse {
    fn retry_after_secs(&self) -> Option<u64> {
        self.headers.get("retry-after")?.trim().parse().ok()
    }
}

/// The engine's only dependency on HTTP.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<TransportResponse>;
}

/// Production transport: reqwest with bearer auth and a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractError::Network {
                endpoint: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<TransportResponse> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        request = request.bearer_auth(&self.token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ExtractError::Network {
            endpoint: path.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| ExtractError::Network {
            endpoint: path.to_string(),
            message: e.to_string(),
        })?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Retry/backoff settings, passed into [`ApiClient::new`] explicitly so the
/// policy is testable and overridable per client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first request.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries + 1,
            ..Self::default()
        }
    }

    /// Base delay before retrying after the given attempt (1-based), doubling
    /// each time and capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = (self.initial_backoff.as_millis() as u64)
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(ms.min(self.max_backoff.as_millis() as u64))
    }

    /// Backoff delay with random jitter of up to a quarter of the base, so
    /// concurrent clients do not retry in lockstep. Below the cap the jitter
    /// stays within the doubling step, so successive delays do not shrink.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        let base_ms = base.as_millis() as u64;
        if base_ms < 4 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
        base + Duration::from_millis(jitter)
    }
}

fn snippet(body: &str) -> String {
    const MAX_CHARS: usize = 250;
    if body.chars().count() <= MAX_CHARS {
        body.to_string()
    } else {
        let truncated: String = body.chars().take(MAX_CHARS).collect();
        format!("{}...", truncated)
    }
}

/// JSON API client with retry/backoff, shared by every component that talks
/// to HubSpot.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
        self.execute(Method::Get, path, query, None).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(Method::Post, path, &[], Some(body)).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = match self.transport.request(method, path, query, body).await {
                Ok(response) => response,
                Err(err @ ExtractError::Network { .. }) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.jittered_delay(attempt);
                    tracing::warn!(path, attempt, ?delay, "network error, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match response.status {
                200..=299 => {
                    return serde_json::from_str(&response.body).map_err(|e| {
                        ExtractError::InvalidResponse {
                            endpoint: path.to_string(),
                            message: format!("{} (body: {})", e, snippet(&response.body)),
                        }
                    });
                }
                401 | 403 => {
                    return Err(ExtractError::Auth {
                        endpoint: path.to_string(),
                        message: snippet(&response.body),
                    });
                }
                429 => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ExtractError::RateLimitExceeded {
                            endpoint: path.to_string(),
                            attempts: attempt,
                        });
                    }
                    let delay = response
                        .retry_after_secs()
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.retry.backoff_delay(attempt));
                    tracing::warn!(path, attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                500..=599 => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ExtractError::UpstreamServer {
                            endpoint: path.to_string(),
                            status: response.status,
                            attempts: attempt,
                            message: snippet(&response.body),
                        });
                    }
                    let delay = self.retry.jittered_delay(attempt);
                    tracing::warn!(
                        path,
                        attempt,
                        status = response.status,
                        ?delay,
                        "upstream error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                status => {
                    return Err(ExtractError::BadRequest {
                        endpoint: path.to_string(),
                        status,
                        message: snippet(&response.body),
                    });
                }
            }
        }
    }

    /// Start paging an endpoint. The stream is lazy: nothing is requested
    /// until the first [`PageStream::next_page`] call.
    pub fn paginate<'a>(
        &'a self,
        def: &'a EndpointDefinition,
        filters: FetchFilters,
    ) -> PageStream<'a> {
        PageStream {
            client: self,
            def,
            filters,
            cursor: PageCursor::Start,
        }
    }
}

/// Per-request filters applied while paging one object type.
#[derive(Debug, Clone, Default)]
pub struct FetchFilters {
    /// Properties to request (comma-joined into the `properties` param).
    pub properties: Vec<String>,
    /// Properties to request history for; non-empty halves the page size.
    pub properties_with_history: Vec<String>,
    /// List archived records instead of live ones.
    pub archived: bool,
    /// Only records modified at or after this epoch-millisecond bound.
    /// Selects the search variant on CRM v3 endpoints.
    pub modified_since: Option<i64>,
}

impl FetchFilters {
    fn page_size(&self) -> u32 {
        if self.properties_with_history.is_empty() {
            PAGE_MAX_SIZE
        } else {
            PAGE_WITH_HISTORY_MAX_SIZE
        }
    }
}

/// Pagination position. Legacy offsets are kept as raw JSON because v1
/// endpoints return either numbers or opaque strings.
#[derive(Debug, Clone, PartialEq)]
pub enum PageCursor {
    Start,
    After(String),
    Offset(Value),
    Exhausted,
}

/// Lazy page sequence over one endpoint. Single-pass and non-restartable:
/// to re-read an object type, start a fresh [`ApiClient::paginate`] call.
pub struct PageStream<'a> {
    client: &'a ApiClient,
    def: &'a EndpointDefinition,
    filters: FetchFilters,
    cursor: PageCursor,
}

impl PageStream<'_> {
    /// Fetch the next page, or `None` once the server reports no further
    /// cursor. A failed request leaves the stream exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>> {
        if self.cursor == PageCursor::Exhausted {
            return Ok(None);
        }

        let outcome = match &self.def.paging {
            PagingStyle::Cursor => {
                if self.filters.modified_since.is_some() && self.def.since_property.is_some() {
                    self.search_page().await
                } else {
                    self.list_page().await
                }
            }
            PagingStyle::Offset {
                results_key,
                has_more_key,
                limit_key,
                limit,
            } => {
                self.offset_page(results_key, has_more_key, limit_key, *limit)
                    .await
            }
        };

        match outcome {
            Ok((records, next)) => {
                self.cursor = next;
                Ok(Some(records))
            }
            Err(err) => {
                self.cursor = PageCursor::Exhausted;
                Err(err)
            }
        }
    }

    /// CRM v3 listing: GET with `properties`, `archived`, and the `after`
    /// cursor from the previous envelope.
    async fn list_page(&self) -> Result<(Vec<RawRecord>, PageCursor)> {
        let mut query = vec![("limit".to_string(), self.filters.page_size().to_string())];

        if self.def.supports_archived {
            query.push(("archived".to_string(), self.filters.archived.to_string()));
        }
        if self.def.supports_properties && !self.filters.properties.is_empty() {
            query.push(("properties".to_string(), self.filters.properties.join(",")));
        }
        if self.def.supports_properties && !self.filters.properties_with_history.is_empty() {
            query.push((
                "propertiesWithHistory".to_string(),
                self.filters.properties_with_history.join(","),
            ));
        }
        if let PageCursor::After(after) = &self.cursor {
            query.push(("after".to_string(), after.clone()));
        }

        let body = self.client.get_json(&self.def.path, &query).await?;
        Ok(parse_cursor_envelope(&body))
    }

    /// CRM v3 search: POST with a GTE filter on the endpoint's modified
    /// property. The cursor travels inside the request body.
    async fn search_page(&self) -> Result<(Vec<RawRecord>, PageCursor)> {
        let since_property = self
            .def
            .since_property
            .expect("search paging requires a since_property");
        let modified_since = self
            .filters
            .modified_since
            .expect("search paging requires a modified-since bound");

        let after = match &self.cursor {
            PageCursor::After(after) => after.clone(),
            _ => "0".to_string(),
        };

        let request = json!({
            "filterGroups": [{
                "filters": [{
                    "propertyName": since_property,
                    "operator": "GTE",
                    "value": modified_since.to_string(),
                }]
            }],
            "sorts": [{
                "propertyName": since_property,
                "direction": "DESCENDING",
            }],
            "properties": self.filters.properties.clone(),
            "limit": self.filters.page_size(),
            "after": after,
        });

        let path = format!("{}/search", self.def.path);
        let body = self.client.post_json(&path, &request).await?;
        Ok(parse_cursor_envelope(&body))
    }

    /// Legacy v1 paging: GET with the endpoint's limit key and the offset
    /// token from the previous envelope; stop when has-more is false.
    async fn offset_page(
        &self,
        results_key: &str,
        has_more_key: &str,
        limit_key: &str,
        limit: u32,
    ) -> Result<(Vec<RawRecord>, PageCursor)> {
        let mut query = vec![(limit_key.to_string(), limit.to_string())];

        if let (Some(param), Some(since)) =
            (self.def.since_query_param, self.filters.modified_since)
        {
            query.push((param.to_string(), since.to_string()));
        }
        if let PageCursor::Offset(offset) = &self.cursor {
            query.push(("offset".to_string(), offset_param(offset)));
        }

        let body = self.client.get_json(&self.def.path, &query).await?;

        let records = body
            .get(results_key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(|| {
                tracing::debug!(path = %self.def.path, "empty response envelope");
                Vec::new()
            });

        let has_more = body.get(has_more_key).and_then(Value::as_bool).unwrap_or(false);
        let next = if has_more {
            match body.get("offset") {
                Some(offset) if !offset.is_null() => PageCursor::Offset(offset.clone()),
                _ => PageCursor::Exhausted,
            }
        } else {
            PageCursor::Exhausted
        };

        Ok((records, next))
    }
}

fn offset_param(offset: &Value) -> String {
    match offset {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull `results` and the next `paging.next.after` cursor out of a CRM v3
/// envelope. A missing cursor ends the stream.
fn parse_cursor_envelope(body: &Value) -> (Vec<RawRecord>, PageCursor) {
    let records = body
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let next = body
        .get("paging")
        .and_then(|p| p.get("next"))
        .and_then(|n| n.get("after"))
        .and_then(Value::as_str)
        .map(|after| PageCursor::After(after.to_string()))
        .unwrap_or(PageCursor::Exhausted);

    (records, next)
}
