//! Telematics provider REST client.
//!
//! Every data call goes through the retry executor; inside one attempt a
//! 401 triggers one token refresh and one replay with the new token.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info};

use super::error::{parse_retry_after, ApiError};
use super::events::parse_event_page;
use super::retry::RetryExecutor;
use super::timestamps::format_path_timestamp;
use super::token::TokenManager;
use crate::config::{env_or, env_string};
use crate::models::TelemetryEvent;

const HAS_MORE_HEADER: &str = "hasmoreitems";
const SINCE_TOKEN_HEADER: &str = "getsincetoken";
const SINCE_TOKEN_PARAM: &str = "getsincetoken";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    /// Incremental feed path, relative to `base_url`.
    pub incremental_path: String,
    /// Historical window path; `/{from}/{to}` is appended.
    pub historical_path: String,
    /// Entity ids named in historical request bodies.
    pub target_ids: Vec<String>,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = env_string("PROVIDER_BASE_URL").context("PROVIDER_BASE_URL is not set")?;
        let token_url = env_string("PROVIDER_TOKEN_URL")
            .unwrap_or_else(|| format!("{}/token", base_url.trim_end_matches('/')));

        let target_ids = env_string("PROVIDER_TARGET_IDS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            base_url,
            token_url,
            client_id: env_string("PROVIDER_CLIENT_ID").unwrap_or_default(),
            client_secret: env_string("PROVIDER_CLIENT_SECRET").unwrap_or_default(),
            username: env_string("PROVIDER_USERNAME").unwrap_or_default(),
            password: env_string("PROVIDER_PASSWORD").unwrap_or_default(),
            incremental_path: env_string("PROVIDER_INCREMENTAL_PATH")
                .unwrap_or_else(|| "events/feed".to_string()),
            historical_path: env_string("PROVIDER_HISTORICAL_PATH")
                .unwrap_or_else(|| "events/history".to_string()),
            target_ids,
            timeout: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 30)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_matches('/')
        )
    }

    pub fn historical_url(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}",
            self.url(&self.historical_path),
            format_path_timestamp(from),
            format_path_timestamp(to)
        )
    }
}

/// One page of the incremental feed.
#[derive(Debug, Clone, Default)]
pub struct IncrementalBatch {
    pub events: Vec<TelemetryEvent>,
    pub has_more: bool,
    /// Token to persist once `events` are durably stored.
    pub next_token: Option<String>,
}

/// Source of telemetry events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Next page after `since_token` (from the start of the feed when `None`).
    async fn fetch_incremental(&self, since_token: Option<&str>)
        -> Result<IncrementalBatch, ApiError>;

    /// Every event in `[from, to)`.
    async fn fetch_historical(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryEvent>, ApiError>;
}

struct RawResponse {
    headers: HeaderMap,
    body: String,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    config: ProviderConfig,
    tokens: Arc<TokenManager>,
    retry: RetryExecutor,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig, tokens: Arc<TokenManager>, retry: RetryExecutor) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("Failed to build provider client")?;

        info!(base_url = %config.base_url, "Provider client ready");
        Ok(Self {
            http,
            config,
            tokens,
            retry,
        })
    }

    async fn send<B>(&self, operation: &str, build: B) -> Result<RawResponse, ApiError>
    where
        B: Fn(&Client) -> RequestBuilder + Sync,
    {
        let build = &build;
        let started = std::time::Instant::now();
        let result = self
            .retry
            .execute(operation, move |_| self.send_once(build))
            .await;
        metrics::histogram!(
            "provider_request_seconds",
            started.elapsed().as_secs_f64(),
            "operation" => operation.to_string()
        );
        result
    }

    /// One attempt: current token, and on 401 one refresh plus one replay.
    async fn send_once<B>(&self, build: &B) -> Result<RawResponse, ApiError>
    where
        B: Fn(&Client) -> RequestBuilder + Sync,
    {
        let token = self.tokens.get_access_token().await?;
        let resp = build(&self.http).bearer_auth(&token).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return read_response(resp).await;
        }

        debug!("Provider rejected token, refreshing");
        let fresh = self.tokens.refresh_after_unauthorized(&token).await?;
        let resp = build(&self.http).bearer_auth(&fresh).send().await?;
        read_response(resp).await
    }
}

async fn read_response(resp: reqwest::Response) -> Result<RawResponse, ApiError> {
    let status = resp.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = parse_retry_after(
            resp.headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
        );
        return Err(ApiError::RateLimited { retry_after });
    }

    let headers = resp.headers().clone();
    let body = resp.text().await?;

    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized(body));
    }
    if !status.is_success() {
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(RawResponse { headers, body })
}

#[async_trait]
impl EventSource for ProviderClient {
    async fn fetch_incremental(
        &self,
        since_token: Option<&str>,
    ) -> Result<IncrementalBatch, ApiError> {
        let url = self.config.url(&self.config.incremental_path);
        let raw = self
            .send("incremental", |http| {
                let req = http.get(&url);
                match since_token {
                    Some(token) => req.query(&[(SINCE_TOKEN_PARAM, token)]),
                    None => req,
                }
            })
            .await?;

        let events = parse_event_page(&raw.body)?;
        let has_more = raw
            .header(HAS_MORE_HEADER)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let next_token = raw.header(SINCE_TOKEN_HEADER).map(str::to_string);

        debug!(
            events = events.len(),
            has_more,
            next_token = ?next_token,
            "Fetched incremental page"
        );
        Ok(IncrementalBatch {
            events,
            has_more,
            next_token,
        })
    }

    async fn fetch_historical(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TelemetryEvent>, ApiError> {
        let url = self.config.historical_url(from, to);
        let body = serde_json::json!({ "ids": self.config.target_ids });

        let raw = self
            .send("historical", |http| http.post(&url).json(&body))
            .await?;
        let events = parse_event_page(&raw.body)?;

        debug!(%from, %to, events = events.len(), "Fetched historical window");
        Ok(events)
    }
}
