//! Job intake, the worker pool, whole-job retries and recurring schedules.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use disco_core::{Backoff, FetchHistory, FetchJob, JobState};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{QueueError, TriggerError};
use crate::policy::RetryPolicy;
use crate::queue::JobQueue;
use crate::worker::{RunReport, Worker};

const MIN_IDLE: Duration = Duration::from_millis(10);

fn empty_params() -> JsonValue {
    JsonValue::Object(Default::default())
}

/// Enqueue contract: `{source_id, params}` plus optional `repeat` (cron),
/// `attempts` and `backoff` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub source_id: String,
    #[serde(default = "empty_params")]
    pub params: JsonValue,
    #[serde(default)]
    pub repeat: Option<String>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl JobRequest {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            params: empty_params(),
            repeat: None,
            attempts: None,
            backoff: None,
        }
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// A job still `running` after this long is assumed abandoned.
    pub lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
            lease: Duration::from_secs(600),
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            pool_size: config.worker_pool,
            poll_interval: config.poll_interval,
            retry: config.retry,
            lease: config.job_timeout.saturating_mul(2),
        }
    }
}

struct SchedulerInner {
    queue: Arc<dyn JobQueue>,
    worker: Arc<Worker>,
    config: SchedulerConfig,
    wake: Notify,
}

/// Cloning shares the queue, worker and wake-up signal.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn JobQueue>, worker: Arc<Worker>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue,
                worker,
                config,
                wake: Notify::new(),
            }),
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.inner.worker
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.inner.queue
    }

    /// Queues a one-off job. Recurring requests go through [`RecurringJobs`].
    pub async fn enqueue(&self, request: JobRequest) -> Result<FetchJob, TriggerError> {
        if let Some(cron) = request.repeat {
            return Err(TriggerError::InvalidSchedule {
                cron,
                message: "recurring requests must be registered as a recurring job".into(),
            });
        }
        if self.inner.worker.registry().get(&request.source_id).is_none() {
            return Err(TriggerError::UnknownSource(request.source_id));
        }

        let attempts = request
            .attempts
            .unwrap_or(self.inner.config.retry.max_attempts);
        let job = FetchJob::new(request.source_id, request.params, attempts)
            .with_backoff(request.backoff);
        self.inner.queue.push(job.clone()).await?;
        info!(job_id = %job.id, source_id = %job.source_id, "job enqueued");
        self.inner.wake.notify_waiters();
        Ok(job)
    }

    /// Skips the request when the source already has a queued or running job.
    pub async fn enqueue_unless_active(
        &self,
        request: JobRequest,
    ) -> Result<Option<FetchJob>, TriggerError> {
        if self.inner.queue.has_active(&request.source_id).await? {
            debug!(source_id = %request.source_id, "source already has an active job, coalescing");
            return Ok(None);
        }
        self.enqueue(request).await.map(Some)
    }

    /// Claims and runs one due job. `None` when nothing was claimable.
    pub async fn process_next(&self) -> Result<Option<RunReport>, QueueError> {
        let Some(job) = self.inner.queue.claim().await? else {
            return Ok(None);
        };
        let report = self.inner.worker.execute(&job).await;
        let settled = self.settle(&job, &report).await;
        self.inner.wake.notify_waiters();
        settled.map(|()| Some(report))
    }

    async fn settle(&self, job: &FetchJob, report: &RunReport) -> Result<(), QueueError> {
        match &report.failure {
            Some(err) if err.is_retryable() && job.has_attempts_left() => {
                let delay = self.inner.config.retry.delay_for_job(job);
                warn!(
                    job_id = %job.id,
                    source_id = %job.source_id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "job failed, retry scheduled"
                );
                self.inner.queue.requeue(job, delay).await?;
            }
            Some(err) => {
                error!(
                    job_id = %job.id,
                    source_id = %job.source_id,
                    attempt = job.attempt,
                    error = %err,
                    "job failed terminally"
                );
                self.inner.queue.complete(job.id, JobState::Failed).await?;
            }
            None => {
                self.inner
                    .queue
                    .complete(job.id, report.job_state())
                    .await?;
            }
        }
        Ok(())
    }

    /// Runs jobs until nothing is queued or running, waiting out retry delays.
    /// Returns the history rows of every execution, in order.
    pub async fn drain(&self) -> Result<Vec<FetchHistory>, QueueError> {
        let mut executed = Vec::new();
        loop {
            if let Some(report) = self.process_next().await? {
                executed.push(report.history);
                continue;
            }
            if self.inner.queue.pending().await? == 0 {
                return Ok(executed);
            }
            let wait = self.idle_wait().await;
            tokio::time::sleep(wait).await;
        }
    }

    /// Returns abandoned running jobs to the queue.
    pub async fn reclaim_stale(&self) -> Result<usize, QueueError> {
        let reclaimed = self.inner.queue.reclaim_stale(self.inner.config.lease).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "requeued jobs whose lease expired");
            self.inner.wake.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn idle_wait(&self) -> Duration {
        if let Err(err) = self.reclaim_stale().await {
            warn!(error = %err, "could not reclaim stale jobs");
        }
        let poll = self.inner.config.poll_interval;
        match self.inner.queue.next_due_in().await {
            Ok(Some(due)) => due.min(poll).max(MIN_IDLE),
            Ok(None) => poll,
            Err(err) => {
                warn!(error = %err, "queue unavailable while idle");
                poll
            }
        }
    }

    /// Starts the fixed-size worker pool. Workers stop once `shutdown` flips
    /// to `true` or its sender is dropped.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.pool_size.max(1))
            .map(|worker_idx| {
                let scheduler = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.worker_loop(worker_idx, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_idx: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = worker_idx, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    let wait = self.idle_wait().await;
                    tokio::select! {
                        _ = self.inner.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(worker = worker_idx, error = %err, "queue error");
                    tokio::time::sleep(self.inner.config.poll_interval).await;
                }
            }
        }
        debug!(worker = worker_idx, "worker stopped");
    }
}

/// tokio-cron-scheduler wants a seconds field; classic five-field
/// expressions fire at second zero.
pub fn with_seconds_field(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Cron-driven job submission. Ticks coalesce: a source that still has a
/// queued or running job is skipped.
pub struct RecurringJobs {
    cron: JobScheduler,
    scheduler: Scheduler,
}

impl RecurringJobs {
    pub async fn new(scheduler: Scheduler) -> anyhow::Result<Self> {
        let cron = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self { cron, scheduler })
    }

    pub async fn add(&self, request: JobRequest) -> Result<Uuid, TriggerError> {
        let Some(cron_expr) = request.repeat.clone() else {
            return Err(TriggerError::InvalidSchedule {
                cron: String::new(),
                message: "recurring job needs a repeat expression".into(),
            });
        };
        if self
            .scheduler
            .worker()
            .registry()
            .get(&request.source_id)
            .is_none()
        {
            return Err(TriggerError::UnknownSource(request.source_id));
        }

        let scheduler = self.scheduler.clone();
        let one_off = JobRequest {
            repeat: None,
            ..request
        };
        let job = Job::new_async(with_seconds_field(&cron_expr).as_str(), move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            let request = one_off.clone();
            Box::pin(async move {
                match scheduler.enqueue_unless_active(request).await {
                    Ok(Some(job)) => debug!(job_id = %job.id, "recurring job submitted"),
                    Ok(None) => {}
                    Err(err) => error!(error = %err, "recurring submission failed"),
                }
            })
        })
        .map_err(|err| TriggerError::InvalidSchedule {
            cron: cron_expr.clone(),
            message: err.to_string(),
        })?;

        self.cron
            .add(job)
            .await
            .map_err(|err| TriggerError::InvalidSchedule {
                cron: cron_expr,
                message: err.to_string(),
            })
    }

    /// One recurring entry per source, all on the same cron expression.
    pub async fn add_for_sources(
        &self,
        cron_expr: &str,
        source_ids: impl IntoIterator<Item = String>,
    ) -> Result<Vec<Uuid>, TriggerError> {
        let mut ids = Vec::new();
        for source_id in source_ids {
            let request = JobRequest {
                repeat: Some(cron_expr.to_string()),
                ..JobRequest::new(source_id)
            };
            ids.push(self.add(request).await?);
        }
        Ok(ids)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.cron.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.cron.shutdown().await.context("stopping scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(with_seconds_field("0 */6 * * *"), "0 0 */6 * * *");
        assert_eq!(with_seconds_field(" 30 0 */6 * * * "), "30 0 */6 * * *");
    }
}
