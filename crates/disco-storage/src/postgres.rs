//! Postgres-backed [`EventStore`].

use anyhow::Context;
use async_trait::async_trait;
use disco_core::{
    CanonicalEvent, DiscoveredEvent, ErrorDetail, FetchHistory, ModerationStatus, RunStatus,
    StagingRecord, StagingStatus,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::gateway::{EventStore, PersistenceError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn db_err(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PersistenceError::Unavailable(err.to_string())
        }
        other => PersistenceError::Database(other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn decode_enum<T>(value: &str, parse: fn(&str) -> Option<T>) -> Result<T, PersistenceError> {
    parse(value).ok_or_else(|| PersistenceError::Database(format!("unexpected enum value {value}")))
}

fn staging_from_row(row: &PgRow) -> Result<StagingRecord, PersistenceError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let canonical: Json<CanonicalEvent> = row.try_get("canonical_payload").map_err(db_err)?;
    let raw: Json<JsonValue> = row.try_get("raw_payload").map_err(db_err)?;
    Ok(StagingRecord {
        id: row.try_get("id").map_err(db_err)?,
        source_id: row.try_get("source_id").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        raw_payload: raw.0,
        canonical_payload: canonical.0,
        status: decode_enum(&status, StagingStatus::parse)?,
        confidence_score: row.try_get("confidence_score").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn discovered_from_row(row: &PgRow) -> Result<DiscoveredEvent, PersistenceError> {
    let moderation: String = row.try_get("moderation_status").map_err(db_err)?;
    let event: Json<CanonicalEvent> = row.try_get("event").map_err(db_err)?;
    Ok(DiscoveredEvent {
        id: row.try_get("id").map_err(db_err)?,
        staging_id: row.try_get("staging_id").map_err(db_err)?,
        source_id: row.try_get("source_id").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        event: event.0,
        moderation_status: decode_enum(&moderation, ModerationStatus::parse)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn history_from_row(row: &PgRow) -> Result<FetchHistory, PersistenceError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let found: i32 = row.try_get("events_found").map_err(db_err)?;
    let processed: i32 = row.try_get("events_processed").map_err(db_err)?;
    let approved: Option<i32> = row.try_get("events_approved").map_err(db_err)?;
    let elapsed: i64 = row.try_get("execution_time_ms").map_err(db_err)?;
    let details: Option<Json<Vec<ErrorDetail>>> = row.try_get("error_details").map_err(db_err)?;
    Ok(FetchHistory {
        id: row.try_get("id").map_err(db_err)?,
        job_id: row.try_get("job_id").map_err(db_err)?,
        source_id: row.try_get("source_id").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        status: decode_enum(&status, RunStatus::parse)?,
        events_found: found.max(0) as u32,
        events_processed: processed.max(0) as u32,
        events_approved: approved.map(|v| v.max(0) as u32),
        execution_time_ms: elapsed.max(0) as u64,
        error_details: details.map(|d| d.0),
    })
}

const HISTORY_COLUMNS: &str = "id, job_id, source_id, started_at, completed_at, status, \
     events_found, events_processed, events_approved, execution_time_ms, error_details";

#[async_trait]
impl EventStore for PgStore {
    async fn find_staged(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StagingRecord>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, external_id, raw_payload, canonical_payload,
                   status, confidence_score, created_at
              FROM staging_events
             WHERE source_id = $1
               AND external_id = $2
            "#,
        )
        .bind(source_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(staging_from_row).transpose()
    }

    async fn insert_staged(&self, record: &StagingRecord) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO staging_events
                (id, source_id, external_id, raw_payload, canonical_payload,
                 status, confidence_score, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(&record.source_id)
        .bind(&record.external_id)
        .bind(Json(&record.raw_payload))
        .bind(Json(&record.canonical_payload))
        .bind(record.status.as_str())
        .bind(record.confidence_score)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(PersistenceError::Duplicate {
                source_id: record.source_id.clone(),
                external_id: record.external_id.clone(),
            }),
            Err(err) => Err(db_err(err)),
        }
    }

    async fn insert_discovered(
        &self,
        event: &DiscoveredEvent,
    ) -> Result<DiscoveredEvent, PersistenceError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO discovered_events
                (id, staging_id, source_id, external_id, title, start_time,
                 category, event, moderation_status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_id, external_id) DO NOTHING
            RETURNING id, staging_id, source_id, external_id, event, moderation_status, created_at
            "#,
        )
        .bind(event.id)
        .bind(event.staging_id)
        .bind(&event.source_id)
        .bind(&event.external_id)
        .bind(&event.event.title)
        .bind(event.event.start_time)
        .bind(event.event.category.as_deref())
        .bind(Json(&event.event))
        .bind(event.moderation_status.as_str())
        .bind(event.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = inserted {
            return discovered_from_row(&row);
        }

        let existing = sqlx::query(
            r#"
            SELECT id, staging_id, source_id, external_id, event, moderation_status, created_at
              FROM discovered_events
             WHERE source_id = $1
               AND external_id = $2
            "#,
        )
        .bind(&event.source_id)
        .bind(&event.external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        discovered_from_row(&existing)
    }

    async fn append_history(&self, row: &FetchHistory) -> Result<(), PersistenceError> {
        let details = row.error_details.as_ref().map(Json);
        sqlx::query(
            r#"
            INSERT INTO fetch_history
                (id, job_id, source_id, started_at, completed_at, status, events_found,
                 events_processed, events_approved, execution_time_ms, error_details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.id)
        .bind(row.job_id)
        .bind(&row.source_id)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.status.as_str())
        .bind(i32::try_from(row.events_found).unwrap_or(i32::MAX))
        .bind(i32::try_from(row.events_processed).unwrap_or(i32::MAX))
        .bind(row.events_approved.map(|v| i32::try_from(v).unwrap_or(i32::MAX)))
        .bind(i64::try_from(row.execution_time_ms).unwrap_or(i64::MAX))
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<FetchHistory>, PersistenceError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM fetch_history ORDER BY started_at DESC, completed_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(history_from_row).collect()
    }

    async fn last_successful_run(
        &self,
        source_id: &str,
    ) -> Result<Option<FetchHistory>, PersistenceError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM fetch_history \
              WHERE source_id = $1 AND status = 'success' \
              ORDER BY started_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<DiscoveredEvent>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, staging_id, source_id, external_id, event, moderation_status, created_at
              FROM discovered_events
             ORDER BY created_at DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(discovered_from_row).collect()
    }
}
