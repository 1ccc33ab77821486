//! Deduplication and the persistence gateway in front of an [`EventStore`].

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use disco_core::{
    CanonicalEvent, DiscoveredEvent, FetchHistory, ModerationStatus, StagingRecord, StagingStatus,
};
use lru::LruCache;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Unique constraint on `(source_id, external_id)` rejected the write.
    #[error("record already exists for {source_id}/{external_id}")]
    Duplicate {
        source_id: String,
        external_id: String,
    },
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage backend. Implementations must enforce uniqueness of
/// `(source_id, external_id)` for staging records and discovered events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_staged(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StagingRecord>, PersistenceError>;

    /// Fails with [`PersistenceError::Duplicate`] when the key exists.
    async fn insert_staged(&self, record: &StagingRecord) -> Result<(), PersistenceError>;

    /// Idempotent: returns the stored row when the key was already promoted.
    async fn insert_discovered(
        &self,
        event: &DiscoveredEvent,
    ) -> Result<DiscoveredEvent, PersistenceError>;

    async fn append_history(&self, row: &FetchHistory) -> Result<(), PersistenceError>;

    /// Newest first by `started_at`.
    async fn recent_history(&self, limit: usize) -> Result<Vec<FetchHistory>, PersistenceError>;

    async fn last_successful_run(
        &self,
        source_id: &str,
    ) -> Result<Option<FetchHistory>, PersistenceError>;

    async fn recent_events(&self, limit: usize) -> Result<Vec<DiscoveredEvent>, PersistenceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Inserted(StagingRecord),
    /// Staged by an earlier run. Its promotion may still be outstanding.
    Existing(StagingRecord),
    /// Staged and promoted earlier in this process.
    Settled(Uuid),
}

impl StageOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Inserted(record) | Self::Existing(record) => record.id,
            Self::Settled(id) => *id,
        }
    }
}

/// Result of projecting a staging record. `created` is false when the
/// discovered row already existed.
#[derive(Debug, Clone, PartialEq)]
pub struct Promotion {
    pub event: DiscoveredEvent,
    pub created: bool,
}

pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Bounded in-process cache of keys whose promotion has landed.
///
/// Only a fast path: a miss here always falls through to the store, whose
/// unique constraint is the authoritative guard.
#[derive(Debug)]
pub struct Deduplicator {
    settled: Mutex<LruCache<(String, String), Uuid>>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DEDUP_CAPACITY)
    }
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            settled: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn known(&self, source_id: &str, external_id: &str) -> Option<Uuid> {
        let mut settled = self.settled.lock().await;
        settled
            .get(&(source_id.to_string(), external_id.to_string()))
            .copied()
    }

    pub async fn remember(&self, source_id: &str, external_id: &str, id: Uuid) {
        let mut settled = self.settled.lock().await;
        settled.put((source_id.to_string(), external_id.to_string()), id);
    }

    pub async fn settled_count(&self) -> usize {
        self.settled.lock().await.len()
    }
}

pub struct PersistenceGateway {
    store: Arc<dyn EventStore>,
    dedup: Deduplicator,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_dedup(store, Deduplicator::new())
    }

    pub fn with_dedup(store: Arc<dyn EventStore>, dedup: Deduplicator) -> Self {
        Self { store, dedup }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Check-then-insert that treats a lost insert race as "already exists".
    pub async fn ensure_staged(
        &self,
        source_id: &str,
        external_id: &str,
        raw_payload: JsonValue,
        canonical_payload: CanonicalEvent,
        status: StagingStatus,
    ) -> Result<StageOutcome, PersistenceError> {
        if let Some(id) = self.dedup.known(source_id, external_id).await {
            return Ok(StageOutcome::Settled(id));
        }

        if let Some(existing) = self.store.find_staged(source_id, external_id).await? {
            return Ok(StageOutcome::Existing(existing));
        }

        let record = StagingRecord {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            external_id: external_id.to_string(),
            raw_payload,
            confidence_score: canonical_payload.completeness(),
            canonical_payload,
            status,
            created_at: Utc::now(),
        };

        match self.store.insert_staged(&record).await {
            Ok(()) => Ok(StageOutcome::Inserted(record)),
            Err(PersistenceError::Duplicate { .. }) => {
                debug!(source_id, external_id, "lost staging insert race, reusing existing row");
                match self.store.find_staged(source_id, external_id).await? {
                    Some(existing) => Ok(StageOutcome::Existing(existing)),
                    None => Err(PersistenceError::Duplicate {
                        source_id: source_id.to_string(),
                        external_id: external_id.to_string(),
                    }),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Projects a staging record into the public table. Rejected records are
    /// not eligible and yield `None`. Safe to repeat for the same record.
    pub async fn promote(
        &self,
        record: &StagingRecord,
        auto_approve: bool,
    ) -> Result<Option<Promotion>, PersistenceError> {
        if record.status == StagingStatus::Rejected {
            self.dedup
                .remember(&record.source_id, &record.external_id, record.id)
                .await;
            return Ok(None);
        }
        let event = DiscoveredEvent {
            id: Uuid::new_v4(),
            staging_id: record.id,
            source_id: record.source_id.clone(),
            external_id: record.external_id.clone(),
            event: record.canonical_payload.clone(),
            moderation_status: ModerationStatus::for_trust(auto_approve),
            created_at: Utc::now(),
        };
        let stored = self.store.insert_discovered(&event).await?;
        self.dedup
            .remember(&record.source_id, &record.external_id, record.id)
            .await;
        Ok(Some(Promotion {
            created: stored.id == event.id,
            event: stored,
        }))
    }

    pub async fn record_run(&self, row: &FetchHistory) -> Result<(), PersistenceError> {
        self.store.append_history(row).await
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<FetchHistory>, PersistenceError> {
        self.store.recent_history(limit).await
    }

    pub async fn last_successful_run(
        &self,
        source_id: &str,
    ) -> Result<Option<FetchHistory>, PersistenceError> {
        self.store.last_successful_run(source_id).await
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<DiscoveredEvent>, PersistenceError> {
        self.store.recent_events(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use disco_core::{Price, Venue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(title: &str) -> CanonicalEvent {
        CanonicalEvent {
            title: title.to_string(),
            description: None,
            start_time: Utc::now(),
            end_time: None,
            venue: Venue::default(),
            category: None,
            tags: vec![],
            image_url: None,
            external_url: None,
            price: Price::default(),
        }
    }

    /// Hides existing rows from the first lookup to simulate a concurrent writer.
    struct RacingStore {
        inner: MemoryStore,
        blind_lookups: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for RacingStore {
        async fn find_staged(
            &self,
            source_id: &str,
            external_id: &str,
        ) -> Result<Option<StagingRecord>, PersistenceError> {
            if self.blind_lookups.load(Ordering::SeqCst) > 0 {
                self.blind_lookups.fetch_sub(1, Ordering::SeqCst);
                return Ok(None);
            }
            self.inner.find_staged(source_id, external_id).await
        }

        async fn insert_staged(&self, record: &StagingRecord) -> Result<(), PersistenceError> {
            self.inner.insert_staged(record).await
        }

        async fn insert_discovered(
            &self,
            event: &DiscoveredEvent,
        ) -> Result<DiscoveredEvent, PersistenceError> {
            self.inner.insert_discovered(event).await
        }

        async fn append_history(&self, row: &FetchHistory) -> Result<(), PersistenceError> {
            self.inner.append_history(row).await
        }

        async fn recent_history(&self, limit: usize) -> Result<Vec<FetchHistory>, PersistenceError> {
            self.inner.recent_history(limit).await
        }

        async fn last_successful_run(
            &self,
            source_id: &str,
        ) -> Result<Option<FetchHistory>, PersistenceError> {
            self.inner.last_successful_run(source_id).await
        }

        async fn recent_events(&self, limit: usize) -> Result<Vec<DiscoveredEvent>, PersistenceError> {
            self.inner.recent_events(limit).await
        }
    }

    #[tokio::test]
    async fn second_stage_of_same_key_reports_existing() {
        let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()));
        let first = gateway
            .ensure_staged("places", "p-1", serde_json::json!({}), event("Cafe"), StagingStatus::Pending)
            .await
            .unwrap();
        let second = gateway
            .ensure_staged("places", "p-1", serde_json::json!({}), event("Cafe"), StagingStatus::Pending)
            .await
            .unwrap();
        assert!(first.inserted());
        assert!(!second.inserted());
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn unique_violation_on_insert_is_treated_as_existing() {
        let inner = MemoryStore::new();
        let gateway_a = PersistenceGateway::new(Arc::new(inner.clone()));
        let original = gateway_a
            .ensure_staged("places", "p-9", serde_json::json!({}), event("Bar"), StagingStatus::Pending)
            .await
            .unwrap();

        let racing = RacingStore {
            inner,
            blind_lookups: AtomicUsize::new(1),
        };
        let gateway_b = PersistenceGateway::new(Arc::new(racing));
        let outcome = gateway_b
            .ensure_staged("places", "p-9", serde_json::json!({}), event("Bar"), StagingStatus::Pending)
            .await
            .unwrap();
        assert!(matches!(&outcome, StageOutcome::Existing(record) if record.id == original.id()));
    }

    #[tokio::test]
    async fn promotion_follows_trust_tier_and_skips_rejected() {
        let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()));
        let StageOutcome::Inserted(record) = gateway
            .ensure_staged("curated", "c-1", serde_json::json!({}), event("Jazz"), StagingStatus::Approved)
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };

        let promoted = gateway.promote(&record, true).await.unwrap().unwrap();
        assert!(promoted.created);
        assert_eq!(promoted.event.moderation_status, ModerationStatus::Approved);

        let mut rejected = record.clone();
        rejected.status = StagingStatus::Rejected;
        assert!(gateway.promote(&rejected, true).await.unwrap().is_none());

        let again = gateway.promote(&record, false).await.unwrap().unwrap();
        assert!(!again.created);
        assert_eq!(again.event.id, promoted.event.id);
        assert_eq!(gateway.recent_events(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn staged_but_unpromoted_records_come_back_for_promotion() {
        let gateway = PersistenceGateway::new(Arc::new(MemoryStore::new()));
        let first = gateway
            .ensure_staged("places", "p-2", serde_json::json!({}), event("Deli"), StagingStatus::Approved)
            .await
            .unwrap();
        assert!(first.inserted());

        let StageOutcome::Existing(record) = gateway
            .ensure_staged("places", "p-2", serde_json::json!({}), event("Deli"), StagingStatus::Approved)
            .await
            .unwrap()
        else {
            panic!("expected the staged record back");
        };
        gateway.promote(&record, true).await.unwrap();

        let settled = gateway
            .ensure_staged("places", "p-2", serde_json::json!({}), event("Deli"), StagingStatus::Approved)
            .await
            .unwrap();
        assert_eq!(settled, StageOutcome::Settled(record.id));
    }

    #[tokio::test]
    async fn dedup_cache_evicts_beyond_capacity() {
        let dedup = Deduplicator::with_capacity(2);
        for n in 0..5 {
            dedup.remember("places", &format!("p-{n}"), Uuid::new_v4()).await;
        }
        assert_eq!(dedup.settled_count().await, 2);
        assert!(dedup.known("places", "p-0").await.is_none());
        assert!(dedup.known("places", "p-4").await.is_some());
    }
}
