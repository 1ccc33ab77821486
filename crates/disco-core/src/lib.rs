//! Core domain model for the event discovery ingestion pipeline.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "disco-core";

/// Outbound call budget for one source: `requests` calls per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_ms: u64,
    /// When set, calls may burst up to this many before spacing kicks in.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 10,
            window_ms: 1_000,
            burst: None,
        }
    }
}

impl RateLimitConfig {
    /// Steady-state spacing between two calls (`window / requests`).
    pub fn interval(&self) -> Duration {
        let requests = u64::from(self.requests.max(1));
        Duration::from_millis(self.window_ms / requests)
    }
}

/// Static description of one external provider, loaded at process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    /// Provider implementation to build, e.g. `places_api`.
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Trust tier. Deliberately has no default: every source must declare it.
    pub auto_approve: bool,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Name of the environment variable holding the provider credential.
    #[serde(default)]
    pub credentials_env: Option<String>,
    #[serde(default)]
    pub options: JsonValue,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(JsonValue::as_str)
    }

    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(JsonValue::as_f64)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(JsonValue::as_u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    PartialFailure,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialFailure | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "partial_failure" => Some(Self::PartialFailure),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Per-job override of the retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

/// One unit of work for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: Uuid,
    pub source_id: String,
    /// Opaque provider-specific query (coordinates, radius, pagination).
    pub params: JsonValue,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub run_after: DateTime<Utc>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl FetchJob {
    pub fn new(source_id: impl Into<String>, params: JsonValue, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            params,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            state: JobState::Queued,
            enqueued_at: now,
            run_after: now,
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Option<Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Provider payload as fetched; consumed only by the producing source's transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: String,
    pub external_id: String,
    pub raw_payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Venue {
    pub name: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Free,
    Paid,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Price {
    #[serde(rename = "type")]
    pub kind: PriceType,
    pub amount: Option<f64>,
    pub currency: Option<String>,
}

/// The single normalized shape every source produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub title: String,
    pub description: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub venue: Venue,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub image_url: Option<String>,
    pub external_url: Option<String>,
    #[serde(default)]
    pub price: Price,
}

impl CanonicalEvent {
    /// Share of populated descriptive fields, in `[0, 1]`.
    pub fn completeness(&self) -> f64 {
        let checks = [
            !self.title.trim().is_empty(),
            self.description.is_some(),
            self.venue.name.is_some(),
            self.venue.address.is_some(),
            self.venue.lat.is_some() && self.venue.lng.is_some(),
            self.category.is_some(),
            self.image_url.is_some(),
            self.external_url.is_some(),
        ];
        let filled = checks.iter().filter(|c| **c).count();
        filled as f64 / checks.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    Approved,
    Rejected,
}

impl StagingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// First-landing record; unique per `(source_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub raw_payload: JsonValue,
    pub canonical_payload: CanonicalEvent,
    pub status: StagingStatus,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Pending,
    Approved,
}

impl ModerationStatus {
    pub fn for_trust(auto_approve: bool) -> Self {
        if auto_approve {
            Self::Approved
        } else {
            Self::Pending
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            _ => None,
        }
    }
}

/// Public projection of a promoted staging record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEvent {
    pub id: Uuid,
    pub staging_id: Uuid,
    pub source_id: String,
    pub external_id: String,
    #[serde(flatten)]
    pub event: CanonicalEvent,
    pub moderation_status: ModerationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the run an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Authenticate,
    Fetch,
    Validate,
    Persist,
    Promote,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub stage: ErrorStage,
    pub external_id: Option<String>,
    pub message: String,
}

/// Audit row: exactly one per job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchHistory {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: RunStatus,
    pub events_found: u32,
    pub events_processed: u32,
    pub events_approved: Option<u32>,
    pub execution_time_ms: u64,
    pub error_details: Option<Vec<ErrorDetail>>,
}
