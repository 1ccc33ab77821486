//! Durable job queue on the `fetch_jobs` table.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so several worker processes can share
//! the table. The partial unique index on running jobs per source backs the
//! single-flight rule: a claim that would start a second running job for a
//! source fails the index and is treated as "nothing claimable". Rows left
//! `running` by a crashed process are returned to the queue once their
//! lease expires.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use disco_core::{Backoff, FetchJob, JobState};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::JobQueue;

const JOB_COLUMNS: &str =
    "id, source_id, params, attempt, max_attempts, state, enqueued_at, run_after, backoff";

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<FetchJob, QueueError> {
    let state: String = row.try_get("state")?;
    let params: Json<JsonValue> = row.try_get("params")?;
    let backoff: Option<Json<Backoff>> = row.try_get("backoff")?;
    let attempt: i32 = row.try_get("attempt")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    Ok(FetchJob {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        params: params.0,
        attempt: attempt.max(1) as u32,
        max_attempts: max_attempts.max(1) as u32,
        state: JobState::parse(&state)
            .ok_or_else(|| QueueError::Parse(format!("unexpected job state {state}")))?,
        enqueued_at: row.try_get("enqueued_at")?,
        run_after: row.try_get("run_after")?,
        backoff: backoff.map(|b| b.0),
    })
}

fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn push(&self, job: FetchJob) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO fetch_jobs
                (id, source_id, params, attempt, max_attempts, state, enqueued_at, run_after, backoff)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, $8)
            "#,
        )
        .bind(job.id)
        .bind(&job.source_id)
        .bind(Json(&job.params))
        .bind(as_i32(job.attempt))
        .bind(as_i32(job.max_attempts))
        .bind(job.enqueued_at)
        .bind(job.run_after)
        .bind(job.backoff.map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self) -> Result<Option<FetchJob>, QueueError> {
        let sql = format!(
            r#"
            UPDATE fetch_jobs
               SET state = 'running', started_at = now()
             WHERE id = (
                SELECT j.id
                  FROM fetch_jobs j
                 WHERE j.state = 'queued'
                   AND j.run_after <= now()
                   AND NOT EXISTS (
                       SELECT 1 FROM fetch_jobs r
                        WHERE r.source_id = j.source_id
                          AND r.state = 'running')
                 ORDER BY j.run_after, j.enqueued_at
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED)
            RETURNING {JOB_COLUMNS}
            "#
        );
        match sqlx::query(&sql).fetch_optional(&self.pool).await {
            Ok(row) => row.as_ref().map(job_from_row).transpose(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                debug!("claim raced another worker for the same source");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn complete(&self, job_id: Uuid, state: JobState) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE fetch_jobs
               SET state = $2, finished_at = now()
             WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(job_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn requeue(&self, job: &FetchJob, delay: Duration) -> Result<FetchJob, QueueError> {
        let run_after = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let sql = format!(
            r#"
            UPDATE fetch_jobs
               SET state = 'queued', attempt = attempt + 1, run_after = $2, started_at = NULL
             WHERE id = $1 AND state = 'running'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job.id)
            .bind(run_after)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::NotFound(job.id))?;
        job_from_row(&row)
    }

    async fn has_active(&self, source_id: &str) -> Result<bool, QueueError> {
        let active: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM fetch_jobs
                 WHERE source_id = $1 AND state IN ('queued', 'running'))
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fetch_jobs WHERE state IN ('queued', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn next_due_in(&self) -> Result<Option<Duration>, QueueError> {
        let next: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(j.run_after)
              FROM fetch_jobs j
             WHERE j.state = 'queued'
               AND NOT EXISTS (
                   SELECT 1 FROM fetch_jobs r
                    WHERE r.source_id = j.source_id AND r.state = 'running')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<usize, QueueError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            UPDATE fetch_jobs
               SET state = 'queued', run_after = now(), started_at = NULL
             WHERE state = 'running'
               AND started_at < now() - ($1::bigint * interval '1 millisecond')
            "#,
        )
        .bind(lease_ms)
        .execute(&self.pool)
        .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}
