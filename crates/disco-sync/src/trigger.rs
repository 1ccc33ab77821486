//! "Run now" and status operations consumed by the admin surfaces.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use disco_core::{DiscoveredEvent, FetchHistory, SourceConfig};
use disco_storage::PersistenceGateway;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;
use uuid::Uuid;

use crate::error::TriggerError;
use crate::scheduler::{JobRequest, Scheduler};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNowRequest {
    pub source_id: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub params: Option<JsonValue>,
}

impl RunNowRequest {
    pub fn new(source_id: impl Into<String>, force: bool) -> Self {
        Self {
            source_id: source_id.into(),
            force,
            params: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunNowResponse {
    /// A successful run already happened today; nothing was fetched.
    Skipped {
        source_id: String,
        last_run_at: DateTime<Utc>,
    },
    Enqueued {
        source_id: String,
        job_id: Uuid,
    },
}

/// Same UTC calendar day.
fn same_period(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

#[derive(Clone)]
pub struct TriggerService {
    scheduler: Scheduler,
    gateway: Arc<PersistenceGateway>,
}

impl TriggerService {
    pub fn new(scheduler: Scheduler, gateway: Arc<PersistenceGateway>) -> Self {
        Self { scheduler, gateway }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn run_now(&self, request: RunNowRequest) -> Result<RunNowResponse, TriggerError> {
        self.run_now_at(request, Utc::now()).await
    }

    /// Without `force`, a successful run earlier in the current period makes
    /// this a no-op that reports when that run started.
    pub async fn run_now_at(
        &self,
        request: RunNowRequest,
        now: DateTime<Utc>,
    ) -> Result<RunNowResponse, TriggerError> {
        if self
            .scheduler
            .worker()
            .registry()
            .get(&request.source_id)
            .is_none()
        {
            return Err(TriggerError::UnknownSource(request.source_id));
        }

        if !request.force {
            if let Some(last) = self.gateway.last_successful_run(&request.source_id).await? {
                if same_period(last.started_at, now) {
                    info!(source_id = %request.source_id, last_run_at = %last.started_at, "run skipped, already succeeded today");
                    return Ok(RunNowResponse::Skipped {
                        source_id: request.source_id,
                        last_run_at: last.started_at,
                    });
                }
            }
        }

        let mut job_request = JobRequest::new(request.source_id);
        if let Some(params) = request.params {
            job_request = job_request.with_params(params);
        }
        let job = self.scheduler.enqueue(job_request).await?;
        Ok(RunNowResponse::Enqueued {
            source_id: job.source_id,
            job_id: job.id,
        })
    }

    /// Most recent history rows, newest first.
    pub async fn status(&self, limit: usize) -> Result<Vec<FetchHistory>, TriggerError> {
        Ok(self.gateway.recent_history(limit).await?)
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<DiscoveredEvent>, TriggerError> {
        Ok(self.gateway.recent_events(limit).await?)
    }

    pub fn sources(&self) -> Vec<SourceConfig> {
        self.scheduler.worker().registry().configs()
    }
}
