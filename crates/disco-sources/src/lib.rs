//! Source capability contract, provider implementations and the registry the
//! worker resolves sources from.

pub mod providers;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use disco_core::{CanonicalEvent, RawItem, SourceConfig};
use disco_storage::{FetchError, FetchedResponse, HttpClient, RateLimiter, RetryDisposition};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub use providers::{CuratedVenuesSource, PlacesApiSource, VenueCalendarSource};

pub const CRATE_NAME: &str = "disco-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    /// Credentials or required options are absent. Degraded operation, not failure.
    #[error("source {source_id} is not configured: {message}")]
    Config { source_id: String, message: String },
    #[error("credentials rejected by {source_id}: {message}")]
    Auth { source_id: String, message: String },
    #[error("transient fetch failure for {source_id}: {message}")]
    TransientFetch { source_id: String, message: String },
    /// Malformed payload for a single item.
    #[error("invalid item {external_id:?} from {source_id}: {message}")]
    Validation {
        source_id: String,
        external_id: Option<String>,
        message: String,
    },
    /// Provider answered with a non-retryable error or an unreadable body.
    #[error("upstream error from {source_id}: {message}")]
    Upstream { source_id: String, message: String },
    #[error("invalid job params for {source_id}: {message}")]
    InvalidParams { source_id: String, message: String },
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("job exceeded its {0:?} budget")]
    Timeout(Duration),
}

impl SourceError {
    pub fn config(source_id: &str, message: impl Into<String>) -> Self {
        Self::Config {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_params(source_id: &str, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    /// Maps a transport failure onto the taxonomy: 401/403 are auth
    /// rejections, throttling, 5xx and network errors are transient.
    pub fn from_fetch(source_id: &str, err: FetchError) -> Self {
        let message = err.to_string();
        let source_id = source_id.to_string();
        if err.is_auth_rejection() {
            return Self::Auth { source_id, message };
        }
        match err.disposition() {
            RetryDisposition::Retryable => Self::TransientFetch { source_id, message },
            RetryDisposition::NonRetryable => Self::Upstream { source_id, message },
        }
    }

    /// Aborts the whole job rather than a single item.
    pub fn is_job_fatal(&self) -> bool {
        !matches!(self, Self::Config { .. } | Self::Validation { .. })
    }

    /// Whole-job failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::TransientFetch { .. } | Self::Timeout(_)
        )
    }
}

/// Per-job handles a source uses for outbound work.
#[derive(Clone)]
pub struct SourceContext {
    pub job_id: Uuid,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    credentials: Option<String>,
    http: Arc<dyn HttpClient>,
    limiter: Arc<dyn RateLimiter>,
}

impl SourceContext {
    /// Credentials are read from the environment variable the source config names.
    pub fn for_source(
        config: &SourceConfig,
        job_id: Uuid,
        http: Arc<dyn HttpClient>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        let credentials = config
            .credentials_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|value| !value.trim().is_empty());
        Self {
            job_id,
            source_id: config.id.clone(),
            fetched_at: Utc::now(),
            credentials,
            http,
            limiter,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<String>) -> Self {
        self.credentials = credentials.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }

    /// Rate-limited GET. Every outbound call a source makes goes through here.
    pub async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.limiter.acquire().await;
        debug!(source_id = %self.source_id, job_id = %self.job_id, url, "outbound call");
        self.http.get(&self.source_id, url, query).await
    }
}

impl std::fmt::Debug for SourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceContext")
            .field("job_id", &self.job_id)
            .field("source_id", &self.source_id)
            .field("fetched_at", &self.fetched_at)
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

/// One implementation per external provider.
#[async_trait]
pub trait Source: Send + Sync {
    fn config(&self) -> &SourceConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn auto_approve(&self) -> bool {
        self.config().auto_approve
    }

    /// `Config` when credentials are absent, `Auth` when the provider refuses them.
    /// Providers that only learn of a bad key from a data request may return
    /// `Auth` from [`Source::fetch_events`] instead; the run still records it
    /// under the authenticate stage.
    async fn authenticate(&self, ctx: &SourceContext) -> Result<(), SourceError>;

    /// Returns an empty list, never an error, when credentials are absent.
    async fn fetch_events(
        &self,
        ctx: &SourceContext,
        params: &JsonValue,
    ) -> Result<Vec<RawItem>, SourceError>;

    /// Whether a raw payload carries enough to be transformed.
    fn validate_response(&self, raw: &JsonValue) -> bool;

    /// Pure and total for any item this source produced. No I/O.
    fn transform(&self, item: &RawItem) -> CanonicalEvent;
}

pub type SourceBuilder = fn(SourceConfig) -> Result<Arc<dyn Source>, SourceError>;

/// Maps a provider kind to its constructor. New providers register here
/// instead of being matched by name in the worker.
#[derive(Clone, Default)]
pub struct SourceCatalog {
    builders: HashMap<String, SourceBuilder>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_providers() -> Self {
        let mut catalog = Self::new();
        catalog.register(PlacesApiSource::KIND, PlacesApiSource::build);
        catalog.register(CuratedVenuesSource::KIND, CuratedVenuesSource::build);
        catalog.register(VenueCalendarSource::KIND, VenueCalendarSource::build);
        catalog
    }

    pub fn register(&mut self, kind: &str, builder: SourceBuilder) {
        self.builders.insert(kind.to_string(), builder);
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.builders.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn build(&self, config: SourceConfig) -> Result<Arc<dyn Source>, SourceError> {
        let builder = self.builders.get(&config.kind).ok_or_else(|| {
            SourceError::config(&config.id, format!("unsupported source kind {}", config.kind))
        })?;
        builder(config)
    }

    /// Builds every enabled source. Duplicate ids are a configuration error.
    pub fn build_registry(
        &self,
        configs: impl IntoIterator<Item = SourceConfig>,
    ) -> Result<SourceRegistry, SourceError> {
        let mut registry = SourceRegistry::new();
        for config in configs {
            if !config.enabled {
                debug!(source_id = %config.id, "skipping disabled source");
                continue;
            }
            if registry.get(&config.id).is_some() {
                return Err(SourceError::config(&config.id, "duplicate source id"));
            }
            registry.register(self.build(config)?);
        }
        Ok(registry)
    }
}

#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.id().to_string(), source);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(source_id).cloned()
    }

    pub fn resolve(&self, source_id: &str) -> Result<Arc<dyn Source>, SourceError> {
        self.get(source_id)
            .ok_or_else(|| SourceError::UnknownSource(source_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn configs(&self) -> Vec<SourceConfig> {
        self.sources.values().map(|s| s.config().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
