//! Runs one fetch job end to end and writes its history row.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use disco_core::{
    ErrorDetail, ErrorStage, FetchHistory, FetchJob, JobState, ModerationStatus, RunStatus,
    StagingStatus,
};
use disco_sources::{Source, SourceContext, SourceError, SourceRegistry};
use disco_storage::{HttpClient, PersistenceGateway, RateLimiters, StageOutcome};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Counts gathered while a job runs. Kept outside the timed future so a
/// timeout does not lose what was already done.
#[derive(Debug, Default)]
struct RunTally {
    stage: Option<ErrorStage>,
    fetched: bool,
    found: u32,
    processed: u32,
    approved: u32,
    errors: Vec<ErrorDetail>,
}

impl RunTally {
    fn item_error(&mut self, stage: ErrorStage, external_id: &str, message: String) {
        self.errors.push(ErrorDetail {
            stage,
            external_id: Some(external_id.to_string()),
            message,
        });
    }
}

/// Outcome of one execution: the history row written and the whole-job
/// error, if any, that the scheduler may retry.
#[derive(Debug)]
pub struct RunReport {
    pub history: FetchHistory,
    pub failure: Option<SourceError>,
}

impl RunReport {
    pub fn job_state(&self) -> JobState {
        match self.history.status {
            RunStatus::Success => JobState::Succeeded,
            RunStatus::Partial => JobState::PartialFailure,
            RunStatus::Failed => JobState::Failed,
        }
    }
}

pub struct Worker {
    registry: SourceRegistry,
    gateway: Arc<PersistenceGateway>,
    http: Arc<dyn HttpClient>,
    limiters: RateLimiters,
    job_timeout: Duration,
}

impl Worker {
    pub fn new(
        registry: SourceRegistry,
        gateway: Arc<PersistenceGateway>,
        http: Arc<dyn HttpClient>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            gateway,
            http,
            limiters: RateLimiters::new(),
            job_timeout,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    /// Always appends exactly one history row, whatever the outcome.
    pub async fn execute(&self, job: &FetchJob) -> RunReport {
        let span = info_span!(
            "fetch_job",
            job_id = %job.id,
            source_id = %job.source_id,
            attempt = job.attempt
        );
        self.execute_inner(job).instrument(span).await
    }

    async fn execute_inner(&self, job: &FetchJob) -> RunReport {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        let mut tally = RunTally::default();

        let outcome = match self.registry.resolve(&job.source_id) {
            Ok(source) => {
                let run = self.run_source(source, job, &mut tally);
                let timed = tokio::time::timeout(self.job_timeout, run).await;
                match timed {
                    Ok(result) => result,
                    Err(_) => {
                        tally.stage = Some(ErrorStage::Timeout);
                        Err(SourceError::Timeout(self.job_timeout))
                    }
                }
            }
            Err(err) => Err(err),
        };

        let status = match &outcome {
            Err(_) => RunStatus::Failed,
            Ok(()) if tally.errors.is_empty() => RunStatus::Success,
            Ok(()) => RunStatus::Partial,
        };
        if let Err(err) = &outcome {
            // Providers often reject a key only on the first real request.
            let stage = match err {
                SourceError::Auth { .. } => ErrorStage::Authenticate,
                _ => tally.stage.unwrap_or(ErrorStage::Fetch),
            };
            tally.errors.push(ErrorDetail {
                stage,
                external_id: None,
                message: err.to_string(),
            });
        }

        let history = FetchHistory {
            id: Uuid::new_v4(),
            job_id: Some(job.id),
            source_id: job.source_id.clone(),
            started_at,
            completed_at: Utc::now(),
            status,
            events_found: tally.found,
            events_processed: tally.processed,
            events_approved: tally.fetched.then_some(tally.approved),
            execution_time_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            error_details: (!tally.errors.is_empty()).then_some(tally.errors),
        };

        if let Err(err) = self.gateway.record_run(&history).await {
            error!(error = %err, "failed to append fetch history");
        }
        info!(
            status = %history.status,
            found = history.events_found,
            processed = history.events_processed,
            elapsed_ms = history.execution_time_ms,
            "job finished"
        );

        RunReport {
            history,
            failure: outcome.err(),
        }
    }

    async fn run_source(
        &self,
        source: Arc<dyn Source>,
        job: &FetchJob,
        tally: &mut RunTally,
    ) -> Result<(), SourceError> {
        let config = source.config();
        let limiter = self.limiters.for_source(&config.id, &config.rate_limit).await;
        let ctx = SourceContext::for_source(config, job.id, self.http.clone(), limiter);

        tally.stage = Some(ErrorStage::Authenticate);
        match source.authenticate(&ctx).await {
            Ok(()) => {}
            Err(err) if !err.is_job_fatal() => {
                warn!(error = %err, "source not configured, continuing in degraded mode");
            }
            Err(err) => return Err(err),
        }

        tally.stage = Some(ErrorStage::Fetch);
        let items = source.fetch_events(&ctx, &job.params).await?;
        tally.fetched = true;
        tally.found = u32::try_from(items.len()).unwrap_or(u32::MAX);
        debug!(found = tally.found, "fetched raw items");

        let auto_approve = source.auto_approve();
        let staging_status = if auto_approve {
            StagingStatus::Approved
        } else {
            StagingStatus::Pending
        };

        tally.stage = Some(ErrorStage::Persist);
        for item in items {
            if !source.validate_response(&item.raw_payload) {
                warn!(external_id = %item.external_id, "item failed validation, skipping");
                tally.item_error(
                    ErrorStage::Validate,
                    &item.external_id,
                    "payload failed validation".to_string(),
                );
                continue;
            }

            let canonical = source.transform(&item);
            let staged = self
                .gateway
                .ensure_staged(
                    &item.source_id,
                    &item.external_id,
                    item.raw_payload,
                    canonical,
                    staging_status,
                )
                .await;

            let record = match staged {
                Ok(StageOutcome::Inserted(record)) => record,
                Ok(StageOutcome::Existing(record)) => {
                    debug!(external_id = %item.external_id, "already staged, re-checking promotion");
                    record
                }
                Ok(StageOutcome::Settled(_)) => {
                    debug!(external_id = %item.external_id, "already staged and promoted");
                    tally.processed += 1;
                    continue;
                }
                Err(err) => {
                    warn!(external_id = %item.external_id, error = %err, "staging failed, skipping item");
                    tally.item_error(ErrorStage::Persist, &item.external_id, err.to_string());
                    continue;
                }
            };
            tally.processed += 1;

            match self.gateway.promote(&record, auto_approve).await {
                Ok(Some(promotion))
                    if promotion.created
                        && promotion.event.moderation_status == ModerationStatus::Approved =>
                {
                    tally.approved += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(external_id = %item.external_id, error = %err, "promotion failed");
                    tally.item_error(ErrorStage::Promote, &item.external_id, err.to_string());
                }
            }
        }
        Ok(())
    }
}
