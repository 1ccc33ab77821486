//! HTTP transport, rate limiting and persistence for the ingestion pipeline.

pub mod gateway;
pub mod memory;
pub mod postgres;
pub mod rate_limit;
pub mod scripted;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};

pub use gateway::{
    Deduplicator, EventStore, PersistenceError, PersistenceGateway, Promotion, StageOutcome,
    DEFAULT_DEDUP_CAPACITY,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rate_limit::{build_limiter, FixedDelayLimiter, RateLimiter, RateLimiters, TokenBucketLimiter};
pub use scripted::{ScriptedHttp, ScriptedReply};

pub const CRATE_NAME: &str = "disco-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }

    /// Provider refused the credentials.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401 | 403, .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Outbound GET used by sources. Faked in tests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
        }
    }
}

/// reqwest-backed client with global and per-source concurrency caps.
///
/// Retries are not done here: a failed call surfaces to the job, and the
/// scheduler decides whether the whole job is retried.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }
}

#[async_trait]
impl HttpClient for HttpFetcher {
    async fn get(
        &self,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores are never closed, so acquire cannot fail.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        // The query may carry credentials; only the base url is recorded.
        let span = tracing::info_span!("http_fetch", source_id, url);
        async {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().path().to_string();
            debug!(status = status.as_u16(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn auth_rejection_is_detected_from_status() {
        let err = FetchError::HttpStatus {
            status: 403,
            url: "https://example.test/places".into(),
        };
        assert!(err.is_auth_rejection());
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);

        let outage = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test/places".into(),
        };
        assert!(!outage.is_auth_rejection());
        assert_eq!(outage.disposition(), RetryDisposition::Retryable);
    }

    #[test]
    fn response_json_reports_decode_errors() {
        let resp = FetchedResponse {
            status: 200,
            final_url: "/calendar".into(),
            body: b"<html>".to_vec(),
        };
        assert!(matches!(resp.json(), Err(FetchError::Decode { .. })));
        assert_eq!(resp.text(), "<html>");
    }
}
