use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use disco_core::{
    Backoff, BackoffKind, CanonicalEvent, DiscoveredEvent, ErrorStage, FetchHistory, FetchJob,
    JobState, Price, RawItem, RunStatus, SourceConfig, StagingRecord, Venue,
};
use disco_sources::{PlacesApiSource, Source, SourceContext, SourceError, SourceRegistry};
use disco_storage::{EventStore, MemoryStore, PersistenceError, ScriptedHttp};
use disco_sync::{
    IngestionRuntime, JobQueue, JobRequest, MemoryQueue, RecurringJobs, RunNowRequest,
    RunNowResponse, SyncConfig, TriggerError,
};
use serde_json::{json, Value as JsonValue};
use tokio::sync::watch;
use tokio::time::Instant;

enum Plan {
    RejectCredentials,
    DenyOnFetch,
    Items { total: usize, invalid: Vec<usize> },
}

struct FakeSource {
    config: SourceConfig,
    plan: Plan,
    hold: Duration,
    attempts_at: Mutex<Vec<Instant>>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSource {
    fn new(id: &str, auto_approve: bool, plan: Plan) -> Self {
        let config = serde_json::from_value(json!({
            "id": id,
            "name": id,
            "kind": "fake",
            "auto_approve": auto_approve,
            "rate_limit": {"requests": 1000, "window_ms": 1000}
        }))
        .unwrap();
        Self {
            config,
            plan,
            hold: Duration::ZERO,
            attempts_at: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts_at.lock().unwrap().clone()
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for FakeSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn authenticate(&self, _ctx: &SourceContext) -> Result<(), SourceError> {
        self.attempts_at.lock().unwrap().push(Instant::now());
        match self.plan {
            Plan::RejectCredentials => Err(SourceError::Auth {
                source_id: self.config.id.clone(),
                message: "key revoked".into(),
            }),
            Plan::DenyOnFetch | Plan::Items { .. } => Ok(()),
        }
    }

    async fn fetch_events(
        &self,
        ctx: &SourceContext,
        _params: &JsonValue,
    ) -> Result<Vec<RawItem>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Plan::DenyOnFetch = self.plan {
            return Err(SourceError::Auth {
                source_id: self.config.id.clone(),
                message: "REQUEST_DENIED".into(),
            });
        }

        let Plan::Items { total, invalid } = &self.plan else {
            return Ok(Vec::new());
        };
        Ok((0..*total)
            .map(|idx| RawItem {
                source_id: self.config.id.clone(),
                external_id: format!("item-{idx}"),
                raw_payload: if invalid.contains(&idx) {
                    json!({"garbled": true})
                } else {
                    json!({"title": format!("Item {idx}")})
                },
                fetched_at: ctx.fetched_at,
            })
            .collect())
    }

    fn validate_response(&self, raw: &JsonValue) -> bool {
        raw.get("title").and_then(JsonValue::as_str).is_some()
    }

    fn transform(&self, item: &RawItem) -> CanonicalEvent {
        CanonicalEvent {
            title: item.raw_payload["title"].as_str().unwrap_or_default().to_string(),
            description: None,
            start_time: item.fetched_at,
            end_time: None,
            venue: Venue::default(),
            category: Some("community".into()),
            tags: vec![],
            image_url: None,
            external_url: None,
            price: Price::default(),
        }
    }
}

/// Delegates to a [`MemoryStore`] but stalls every staging insert after the first.
struct StallingStore {
    inner: MemoryStore,
    inserts: AtomicUsize,
}

#[async_trait]
impl EventStore for StallingStore {
    async fn find_staged(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StagingRecord>, PersistenceError> {
        self.inner.find_staged(source_id, external_id).await
    }

    async fn insert_staged(&self, record: &StagingRecord) -> Result<(), PersistenceError> {
        if self.inserts.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
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

/// Delegates to a [`MemoryStore`] but fails staging for chosen keys and the
/// first `promote_failures` promotions.
struct FaultyStore {
    inner: MemoryStore,
    failing_keys: Vec<String>,
    promote_failures: AtomicUsize,
    staging_attempts: Mutex<Vec<String>>,
}

impl FaultyStore {
    fn new(failing_keys: &[&str], promote_failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_keys: failing_keys.iter().map(|k| k.to_string()).collect(),
            promote_failures: AtomicUsize::new(promote_failures),
            staging_attempts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventStore for FaultyStore {
    async fn find_staged(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<StagingRecord>, PersistenceError> {
        self.inner.find_staged(source_id, external_id).await
    }

    async fn insert_staged(&self, record: &StagingRecord) -> Result<(), PersistenceError> {
        self.staging_attempts
            .lock()
            .unwrap()
            .push(record.external_id.clone());
        if self.failing_keys.contains(&record.external_id) {
            return Err(PersistenceError::Database("disk full".into()));
        }
        self.inner.insert_staged(record).await
    }

    async fn insert_discovered(
        &self,
        event: &DiscoveredEvent,
    ) -> Result<DiscoveredEvent, PersistenceError> {
        let remaining = self.promote_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.promote_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PersistenceError::Unavailable("connection reset".into()));
        }
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

fn runtime_over(source: Arc<dyn Source>, store: Arc<dyn EventStore>) -> IngestionRuntime {
    IngestionRuntime::assemble(
        SyncConfig::default(),
        registry(vec![source]),
        store,
        Arc::new(MemoryQueue::new()),
        Arc::new(ScriptedHttp::new()),
    )
}

struct Harness {
    runtime: IngestionRuntime,
    store: MemoryStore,
    queue: Arc<MemoryQueue>,
    http: ScriptedHttp,
}

fn registry(sources: Vec<Arc<dyn Source>>) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    registry
}

fn harness_with(sources: Vec<Arc<dyn Source>>, config: SyncConfig) -> Harness {
    let store = MemoryStore::new();
    let queue = Arc::new(MemoryQueue::new());
    let http = ScriptedHttp::new();
    let runtime = IngestionRuntime::assemble(
        config,
        registry(sources),
        Arc::new(store.clone()),
        queue.clone(),
        Arc::new(http.clone()),
    );
    Harness {
        runtime,
        store,
        queue,
        http,
    }
}

fn harness(sources: Vec<Arc<dyn Source>>) -> Harness {
    harness_with(sources, SyncConfig::default())
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_retry_with_exponential_backoff() {
    let source = Arc::new(FakeSource::new("strict", true, Plan::RejectCredentials));
    let h = harness(vec![source.clone()]);

    h.runtime
        .scheduler
        .enqueue(JobRequest::new("strict"))
        .await
        .unwrap();
    let runs = h.runtime.scheduler.drain().await.unwrap();

    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|row| row.status == RunStatus::Failed));
    assert!(runs.iter().all(|row| row.events_approved.is_none()));
    let details = runs[0].error_details.as_ref().unwrap();
    assert_eq!(details[0].stage, ErrorStage::Authenticate);

    let attempts = source.attempts();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[1] - attempts[0], Duration::from_millis(2000));
    assert_eq!(attempts[2] - attempts[1], Duration::from_millis(4000));
    assert_eq!(source.fetches(), 0);

    let finished = h.queue.finished().await;
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].state, JobState::Failed);
    assert_eq!(finished[0].attempt, 3);
    assert_eq!(h.store.history().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn key_rejected_by_a_data_request_is_recorded_as_authentication() {
    let source = Arc::new(FakeSource::new("places", true, Plan::DenyOnFetch));
    let h = harness(vec![source.clone()]);

    h.runtime
        .scheduler
        .enqueue(JobRequest::new("places"))
        .await
        .unwrap();
    let runs = h.runtime.scheduler.drain().await.unwrap();

    assert_eq!(runs.len(), 3);
    assert_eq!(source.fetches(), 3);
    for run in &runs {
        assert_eq!(run.status, RunStatus::Failed);
        let details = run.error_details.as_ref().unwrap();
        assert_eq!(details[0].stage, ErrorStage::Authenticate);
    }
}

#[tokio::test(start_paused = true)]
async fn per_job_fixed_backoff_overrides_the_policy() {
    let source = Arc::new(FakeSource::new("strict", true, Plan::RejectCredentials));
    let h = harness(vec![source.clone()]);

    let request = JobRequest {
        attempts: Some(2),
        backoff: Some(Backoff {
            kind: BackoffKind::Fixed,
            delay_ms: 500,
        }),
        ..JobRequest::new("strict")
    };
    h.runtime.scheduler.enqueue(request).await.unwrap();
    h.runtime.scheduler.drain().await.unwrap();

    let attempts = source.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1] - attempts[0], Duration::from_millis(500));
}

#[tokio::test]
async fn invalid_items_are_skipped_and_the_run_is_partial() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 5,
            invalid: vec![1, 3],
        },
    ));
    let h = harness(vec![source.clone()]);

    h.runtime
        .scheduler
        .enqueue(JobRequest::new("community"))
        .await
        .unwrap();
    let runs = h.runtime.scheduler.drain().await.unwrap();

    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.events_found, 5);
    assert_eq!(run.events_processed, 3);
    assert_eq!(run.events_approved, Some(3));
    let details = run.error_details.as_ref().unwrap();
    assert_eq!(details.len(), 2);
    assert!(details.iter().all(|d| d.stage == ErrorStage::Validate));
    assert_eq!(details[0].external_id.as_deref(), Some("item-1"));

    assert_eq!(h.store.staging_records().await.len(), 3);
    assert_eq!(h.store.discovered_events().await.len(), 3);
    assert_eq!(h.queue.finished().await[0].state, JobState::PartialFailure);
}

#[tokio::test]
async fn rerunning_a_source_does_not_duplicate_events() {
    let source = Arc::new(FakeSource::new(
        "community",
        false,
        Plan::Items {
            total: 3,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source.clone()]);

    for _ in 0..2 {
        h.runtime
            .scheduler
            .enqueue(JobRequest::new("community"))
            .await
            .unwrap();
        h.runtime.scheduler.drain().await.unwrap();
    }

    let history = h.store.history().await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|row| row.status == RunStatus::Success));
    assert_eq!(history[1].events_processed, 3);
    assert_eq!(history[1].events_approved, Some(0));

    assert_eq!(h.store.staging_records().await.len(), 3);
    let events = h.store.discovered_events().await;
    assert_eq!(events.len(), 3);
    assert!(events
        .iter()
        .all(|e| e.moderation_status == disco_core::ModerationStatus::Pending));
    let mut keys: Vec<_> = events.iter().map(|e| e.external_id.clone()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 3);
}

#[tokio::test]
async fn a_failed_staging_write_only_costs_that_item() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 5,
            invalid: vec![],
        },
    ));
    let store = Arc::new(FaultyStore::new(&["item-1", "item-3"], 0));
    let runtime = runtime_over(source, store.clone());

    runtime
        .scheduler
        .enqueue(JobRequest::new("community"))
        .await
        .unwrap();
    let runs = runtime.scheduler.drain().await.unwrap();

    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.events_found, 5);
    assert_eq!(run.events_processed, 3);
    assert_eq!(run.events_approved, Some(3));
    let details = run.error_details.as_ref().unwrap();
    assert_eq!(details.len(), 2);
    assert!(details.iter().all(|d| d.stage == ErrorStage::Persist));
    assert_eq!(details[1].external_id.as_deref(), Some("item-3"));

    assert_eq!(store.staging_attempts.lock().unwrap().len(), 5);
    assert_eq!(store.inner.staging_records().await.len(), 3);
    assert_eq!(store.inner.discovered_events().await.len(), 3);
}

#[tokio::test]
async fn rerun_promotes_records_left_staged_by_a_failed_promotion() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let store = Arc::new(FaultyStore::new(&[], 1));
    let runtime = runtime_over(source, store.clone());

    runtime
        .scheduler
        .enqueue(JobRequest::new("community"))
        .await
        .unwrap();
    let first = runtime.scheduler.drain().await.unwrap();
    assert_eq!(first[0].status, RunStatus::Partial);
    let details = first[0].error_details.as_ref().unwrap();
    assert_eq!(details[0].stage, ErrorStage::Promote);
    assert_eq!(store.inner.staging_records().await.len(), 1);
    assert!(store.inner.discovered_events().await.is_empty());

    runtime
        .scheduler
        .enqueue(JobRequest::new("community"))
        .await
        .unwrap();
    let second = runtime.scheduler.drain().await.unwrap();
    assert_eq!(second[0].status, RunStatus::Success);
    assert_eq!(second[0].events_processed, 1);
    assert_eq!(second[0].events_approved, Some(1));

    assert_eq!(store.inner.staging_records().await.len(), 1);
    let events = store.inner.discovered_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].external_id, "item-0");
}

#[tokio::test(start_paused = true)]
async fn timeout_keeps_counts_gathered_before_the_deadline() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 3,
            invalid: vec![],
        },
    ));
    let store = Arc::new(StallingStore {
        inner: MemoryStore::new(),
        inserts: AtomicUsize::new(0),
    });
    let config = SyncConfig {
        job_timeout: Duration::from_secs(1),
        ..SyncConfig::default()
    };
    let runtime = IngestionRuntime::assemble(
        config,
        registry(vec![source.clone()]),
        store.clone(),
        Arc::new(MemoryQueue::new()),
        Arc::new(ScriptedHttp::new()),
    );

    let job = FetchJob::new("community", json!({}), 1);
    let report = runtime.scheduler.worker().execute(&job).await;

    assert!(matches!(report.failure, Some(SourceError::Timeout(_))));
    assert_eq!(report.history.status, RunStatus::Failed);
    assert_eq!(report.history.events_found, 3);
    assert_eq!(report.history.events_processed, 1);
    let details = report.history.error_details.as_ref().unwrap();
    assert_eq!(details.last().unwrap().stage, ErrorStage::Timeout);
    assert_eq!(store.inner.history().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_job_abandoned_mid_run_is_picked_up_after_its_lease() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 2,
            invalid: vec![],
        },
    ));
    let config = SyncConfig {
        job_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    };
    let h = harness_with(vec![source.clone()], config);

    let job = h
        .runtime
        .scheduler
        .enqueue(JobRequest::new("community"))
        .await
        .unwrap();
    let orphaned = h.queue.claim().await.unwrap().unwrap();
    assert_eq!(orphaned.id, job.id);

    let started = Instant::now();
    let runs = h.runtime.scheduler.drain().await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].job_id, Some(job.id));
    assert_eq!(source.fetches(), 1);
    assert_eq!(h.queue.finished().await[0].state, JobState::Succeeded);
}

#[tokio::test]
async fn every_execution_appends_exactly_one_history_row() {
    let ok = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 2,
            invalid: vec![],
        },
    ));
    let h = harness(vec![ok.clone()]);

    let unknown = FetchJob::new("vanished", json!({}), 1);
    let report = h.runtime.scheduler.worker().execute(&unknown).await;
    assert!(matches!(report.failure, Some(SourceError::UnknownSource(_))));

    let known = FetchJob::new("community", json!({}), 1);
    h.runtime.scheduler.worker().execute(&known).await;

    let history = h.store.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].source_id, "vanished");
    assert_eq!(history[0].status, RunStatus::Failed);
    assert_eq!(history[1].job_id, Some(known.id));
}

#[tokio::test(start_paused = true)]
async fn worker_pool_never_runs_one_source_twice_at_once() {
    let busy = Arc::new(
        FakeSource::new(
            "busy",
            true,
            Plan::Items {
                total: 1,
                invalid: vec![],
            },
        )
        .holding(Duration::from_millis(250)),
    );
    let other = Arc::new(
        FakeSource::new(
            "other",
            true,
            Plan::Items {
                total: 1,
                invalid: vec![],
            },
        )
        .holding(Duration::from_millis(250)),
    );
    let h = harness(vec![busy.clone(), other.clone()]);

    for _ in 0..3 {
        h.runtime
            .scheduler
            .enqueue(JobRequest::new("busy"))
            .await
            .unwrap();
    }
    h.runtime
        .scheduler
        .enqueue(JobRequest::new("other"))
        .await
        .unwrap();

    let (stop, shutdown) = watch::channel(false);
    let handles = h.runtime.scheduler.spawn_workers(shutdown);
    assert_eq!(handles.len(), 4);
    while h.queue.pending().await.unwrap() > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stop.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(busy.fetches(), 3);
    assert_eq!(busy.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(other.fetches(), 1);
    assert_eq!(h.store.history().await.len(), 4);
}

#[tokio::test]
async fn run_now_skips_when_the_source_already_succeeded_today() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source.clone()]);
    let trigger = &h.runtime.trigger;

    let first = trigger
        .run_now(RunNowRequest::new("community", false))
        .await
        .unwrap();
    assert!(matches!(first, RunNowResponse::Enqueued { .. }));
    h.runtime.scheduler.drain().await.unwrap();
    let last = h.store.history().await[0].clone();

    let skipped = trigger
        .run_now_at(RunNowRequest::new("community", false), last.started_at)
        .await
        .unwrap();
    assert_eq!(
        skipped,
        RunNowResponse::Skipped {
            source_id: "community".into(),
            last_run_at: last.started_at,
        }
    );
    assert_eq!(h.queue.pending().await.unwrap(), 0);
    assert_eq!(source.fetches(), 1);

    let next_day = last.started_at + chrono::Duration::days(1);
    let tomorrow = trigger
        .run_now_at(RunNowRequest::new("community", false), next_day)
        .await
        .unwrap();
    assert!(matches!(tomorrow, RunNowResponse::Enqueued { .. }));
    h.runtime.scheduler.drain().await.unwrap();

    let forced = trigger
        .run_now_at(RunNowRequest::new("community", true), last.started_at)
        .await
        .unwrap();
    match forced {
        RunNowResponse::Enqueued { source_id, .. } => assert_eq!(source_id, "community"),
        other => panic!("expected enqueue, got {other:?}"),
    }
    h.runtime.scheduler.drain().await.unwrap();
    assert_eq!(source.fetches(), 3);
    assert_eq!(h.http.calls(), 0);
}

#[tokio::test]
async fn run_now_rejects_unknown_sources() {
    let h = harness(vec![]);
    let err = h
        .runtime
        .trigger
        .run_now(RunNowRequest::new("nowhere", true))
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::UnknownSource(id) if id == "nowhere"));
}

#[tokio::test]
async fn status_lists_recent_runs_newest_first() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source]);
    for _ in 0..3 {
        h.runtime
            .scheduler
            .enqueue(JobRequest::new("community"))
            .await
            .unwrap();
        h.runtime.scheduler.drain().await.unwrap();
    }

    let status = h.runtime.trigger.status(2).await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status[0].started_at >= status[1].started_at);
    assert_eq!(h.runtime.trigger.sources().len(), 1);
    assert_eq!(h.runtime.trigger.recent_events(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn recurring_ticks_coalesce_while_a_job_is_active() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source]);
    let scheduler = &h.runtime.scheduler;

    let first = scheduler
        .enqueue_unless_active(JobRequest::new("community"))
        .await
        .unwrap();
    assert!(first.is_some());
    let second = scheduler
        .enqueue_unless_active(JobRequest::new("community"))
        .await
        .unwrap();
    assert!(second.is_none());
    assert_eq!(h.queue.pending().await.unwrap(), 1);

    scheduler.drain().await.unwrap();
    let third = scheduler
        .enqueue_unless_active(JobRequest::new("community"))
        .await
        .unwrap();
    assert!(third.is_some());
}

#[tokio::test]
async fn one_off_enqueue_refuses_repeat_expressions() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source]);
    let request = JobRequest {
        repeat: Some("0 */6 * * *".into()),
        ..JobRequest::new("community")
    };
    let err = h.runtime.scheduler.enqueue(request).await.unwrap_err();
    assert!(matches!(err, TriggerError::InvalidSchedule { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_jobs_need_a_known_source_and_a_repeat_expression() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source]);
    let recurring = RecurringJobs::new(h.runtime.scheduler.clone()).await.unwrap();

    let missing_repeat = recurring.add(JobRequest::new("community")).await;
    assert!(matches!(
        missing_repeat,
        Err(TriggerError::InvalidSchedule { .. })
    ));

    let unknown = recurring
        .add(JobRequest {
            repeat: Some("0 */6 * * *".into()),
            ..JobRequest::new("nowhere")
        })
        .await;
    assert!(matches!(unknown, Err(TriggerError::UnknownSource(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn default_sync_cron_registers_for_every_source() {
    let source = Arc::new(FakeSource::new(
        "community",
        true,
        Plan::Items {
            total: 1,
            invalid: vec![],
        },
    ));
    let h = harness(vec![source]);
    let recurring = RecurringJobs::new(h.runtime.scheduler.clone()).await.unwrap();

    let cron = SyncConfig::default().sync_cron;
    let ids = recurring
        .add_for_sources(&cron, vec!["community".to_string()])
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let six_field = recurring
        .add(JobRequest {
            repeat: Some("0 15 */6 * * *".into()),
            ..JobRequest::new("community")
        })
        .await;
    assert!(six_field.is_ok());
}

#[tokio::test]
async fn missing_credentials_run_succeeds_with_nothing_fetched() {
    let config: SourceConfig = serde_json::from_value(json!({
        "id": "sydney-places",
        "name": "Sydney places",
        "kind": "places_api",
        "auto_approve": true,
        "credentials_env": "DISCO_TEST_PLACES_KEY_NEVER_SET",
        "options": {"lat": -33.8688, "lng": 151.2093}
    }))
    .unwrap();
    let places = PlacesApiSource::build(config).unwrap();
    let h = harness(vec![places]);

    h.runtime
        .scheduler
        .enqueue(JobRequest::new("sydney-places"))
        .await
        .unwrap();
    let runs = h.runtime.scheduler.drain().await.unwrap();

    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[0].events_found, 0);
    assert_eq!(runs[0].events_approved, Some(0));
    assert!(runs[0].error_details.is_none());
    assert_eq!(h.http.calls(), 0);
    assert!(runs[0].completed_at <= Utc::now());
}
