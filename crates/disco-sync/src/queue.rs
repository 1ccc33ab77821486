//! Fetch job queue. Claims enforce single-flight per source.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use disco_core::{FetchJob, JobState};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: FetchJob) -> Result<(), QueueError>;

    /// Oldest due job whose source has nothing running, marked `Running`.
    async fn claim(&self) -> Result<Option<FetchJob>, QueueError>;

    /// Moves a running job to a terminal state.
    async fn complete(&self, job_id: Uuid, state: JobState) -> Result<(), QueueError>;

    /// Puts a running job back as `Queued` for its next attempt, due after `delay`.
    async fn requeue(&self, job: &FetchJob, delay: Duration) -> Result<FetchJob, QueueError>;

    /// Whether the source has a queued or running job.
    async fn has_active(&self, source_id: &str) -> Result<bool, QueueError>;

    /// Queued plus running jobs.
    async fn pending(&self) -> Result<usize, QueueError>;

    /// Time until the next claimable job is due, `None` when nothing is claimable.
    async fn next_due_in(&self) -> Result<Option<Duration>, QueueError>;

    /// Puts jobs that have been running for longer than `lease` back in the
    /// queue, due immediately. Returns how many were reclaimed.
    async fn reclaim_stale(&self, lease: Duration) -> Result<usize, QueueError>;
}

#[derive(Debug)]
struct QueuedEntry {
    job: FetchJob,
    ready_at: Instant,
}

#[derive(Debug)]
struct RunningEntry {
    job: FetchJob,
    claimed_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    queued: Vec<QueuedEntry>,
    running: Vec<RunningEntry>,
    finished: Vec<FetchJob>,
}

impl MemoryQueueState {
    fn busy_sources(&self) -> HashSet<&str> {
        self.running.iter().map(|e| e.job.source_id.as_str()).collect()
    }

    fn take_running(&mut self, job_id: Uuid) -> Result<FetchJob, QueueError> {
        let idx = self
            .running
            .iter()
            .position(|e| e.job.id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        Ok(self.running.remove(idx).job)
    }
}

/// Process-local queue for tests and one-shot runs. Due times follow the
/// tokio clock so paused-time tests observe exact retry delays.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs that reached a terminal state, in completion order.
    pub async fn finished(&self) -> Vec<FetchJob> {
        self.state.lock().await.finished.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, mut job: FetchJob) -> Result<(), QueueError> {
        job.state = JobState::Queued;
        let delay = (job.run_after - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let mut state = self.state.lock().await;
        state.queued.push(QueuedEntry {
            job,
            ready_at: Instant::now() + delay,
        });
        Ok(())
    }

    async fn claim(&self) -> Result<Option<FetchJob>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let busy = state.busy_sources();
        let pick = state
            .queued
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ready_at <= now && !busy.contains(e.job.source_id.as_str()))
            .min_by_key(|(_, e)| (e.ready_at, e.job.enqueued_at))
            .map(|(idx, _)| idx);
        drop(busy);

        let Some(idx) = pick else {
            return Ok(None);
        };
        let mut job = state.queued.remove(idx).job;
        job.state = JobState::Running;
        state.running.push(RunningEntry {
            job: job.clone(),
            claimed_at: now,
        });
        Ok(Some(job))
    }

    async fn complete(&self, job_id: Uuid, final_state: JobState) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let mut job = state.take_running(job_id)?;
        job.state = final_state;
        state.finished.push(job);
        Ok(())
    }

    async fn requeue(&self, job: &FetchJob, delay: Duration) -> Result<FetchJob, QueueError> {
        let mut state = self.state.lock().await;
        let mut next = state.take_running(job.id)?;
        next.attempt += 1;
        next.state = JobState::Queued;
        next.run_after = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        state.queued.push(QueuedEntry {
            job: next.clone(),
            ready_at: Instant::now() + delay,
        });
        Ok(next)
    }

    async fn has_active(&self, source_id: &str) -> Result<bool, QueueError> {
        let state = self.state.lock().await;
        Ok(state.running.iter().any(|e| e.job.source_id == source_id)
            || state.queued.iter().any(|e| e.job.source_id == source_id))
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state.queued.len() + state.running.len())
    }

    async fn next_due_in(&self) -> Result<Option<Duration>, QueueError> {
        let state = self.state.lock().await;
        let now = Instant::now();
        let busy = state.busy_sources();
        Ok(state
            .queued
            .iter()
            .filter(|e| !busy.contains(e.job.source_id.as_str()))
            .map(|e| e.ready_at.saturating_duration_since(now))
            .min())
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let (stale, live): (Vec<_>, Vec<_>) = state
            .running
            .drain(..)
            .partition(|e| now.saturating_duration_since(e.claimed_at) > lease);
        state.running = live;
        let reclaimed = stale.len();
        for entry in stale {
            let mut job = entry.job;
            job.state = JobState::Queued;
            job.run_after = Utc::now();
            state.queued.push(QueuedEntry { job, ready_at: now });
        }
        Ok(reclaimed)
    }
}
