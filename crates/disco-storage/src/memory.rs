//! In-process [`EventStore`] used by tests and one-shot runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use disco_core::{DiscoveredEvent, FetchHistory, RunStatus, StagingRecord};
use tokio::sync::Mutex;

use crate::gateway::{EventStore, PersistenceError};

type Key = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    staging: HashMap<Key, StagingRecord>,
    discovered: HashMap<Key, DiscoveredEvent>,
    history: Vec<FetchHistory>,
}

/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn staging_records(&self) -> Vec<StagingRecord> {
        let state = self.state.lock().await;
        state.staging.values().cloned().collect()
    }

    pub async fn discovered_events(&self) -> Vec<DiscoveredEvent> {
        let state = self.state.lock().await;
        state.discovered.values().cloned().collect()
    }

    /// History rows in append order.
    pub async fn history(&self) -> Vec<FetchHistory> {
        let state = self.state.lock().await;
        state.history.clone()
    }
}

fn key(source_id: &str, external_id: &str) -> Key {
    (source_id.to_string(), external_id.to_string())
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn find_staged(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StagingRecord>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state.staging.get(&key(source_id, external_id)).cloned())
    }

    async fn insert_staged(&self, record: &StagingRecord) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let k = key(&record.source_id, &record.external_id);
        if state.staging.contains_key(&k) {
            return Err(PersistenceError::Duplicate {
                source_id: record.source_id.clone(),
                external_id: record.external_id.clone(),
            });
        }
        state.staging.insert(k, record.clone());
        Ok(())
    }

    async fn insert_discovered(
        &self,
        event: &DiscoveredEvent,
    ) -> Result<DiscoveredEvent, PersistenceError> {
        let mut state = self.state.lock().await;
        let stored = state
            .discovered
            .entry(key(&event.source_id, &event.external_id))
            .or_insert_with(|| event.clone());
        Ok(stored.clone())
    }

    async fn append_history(&self, row: &FetchHistory) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.history.push(row.clone());
        Ok(())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<FetchHistory>, PersistenceError> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state.history.iter().rev().cloned().collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn last_successful_run(
        &self,
        source_id: &str,
    ) -> Result<Option<FetchHistory>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|row| row.source_id == source_id && row.status == RunStatus::Success)
            .max_by_key(|row| row.started_at)
            .cloned())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<DiscoveredEvent>, PersistenceError> {
        let state = self.state.lock().await;
        let mut events: Vec<_> = state.discovered.values().cloned().collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit);
        Ok(events)
    }
}
