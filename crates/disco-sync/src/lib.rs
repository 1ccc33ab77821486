//! Ingestion orchestration: configuration, job queue, worker, scheduler and
//! the trigger/status surface.

pub mod config;
pub mod error;
pub mod pg_queue;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod trigger;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use disco_sources::{SourceCatalog, SourceRegistry};
use disco_storage::{
    EventStore, HttpClient, HttpClientConfig, HttpFetcher, MemoryStore, PersistenceGateway, PgStore,
};
use tracing::{info, warn};

pub use config::{SourcesFile, SyncConfig};
pub use error::{QueueError, TriggerError};
pub use pg_queue::PgJobQueue;
pub use policy::RetryPolicy;
pub use queue::{JobQueue, MemoryQueue};
pub use scheduler::{JobRequest, RecurringJobs, Scheduler, SchedulerConfig};
pub use trigger::{RunNowRequest, RunNowResponse, TriggerService};
pub use worker::{RunReport, Worker};

pub const CRATE_NAME: &str = "disco-sync";

/// Everything a process needs to ingest, wired once at start-up.
pub struct IngestionRuntime {
    pub config: SyncConfig,
    pub gateway: Arc<PersistenceGateway>,
    pub scheduler: Scheduler,
    pub trigger: TriggerService,
    pg: Option<PgStore>,
}

impl IngestionRuntime {
    /// Postgres-backed when `DATABASE_URL` is set, in-memory otherwise.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let sources = SourcesFile::load(&config.sources_file).await?;
        let registry = SourceCatalog::with_builtin_providers()
            .build_registry(sources.sources)
            .context("building source registry")?;
        info!(sources = registry.len(), "source registry ready");

        let http: Arc<dyn HttpClient> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let runtime = match config.database_url.clone() {
            Some(url) => {
                let max_connections = u32::try_from(config.worker_pool).unwrap_or(16) + 4;
                let pg = PgStore::connect(&url, max_connections).await?;
                let queue = Arc::new(PgJobQueue::new(pg.pool().clone()));
                Self::assemble(config, registry, Arc::new(pg.clone()), queue, http)
                    .with_postgres(pg)
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory storage and queue");
                Self::assemble(
                    config,
                    registry,
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemoryQueue::new()),
                    http,
                )
            }
        };
        Ok(runtime)
    }

    pub fn assemble(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn EventStore>,
        queue: Arc<dyn JobQueue>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        let gateway = Arc::new(PersistenceGateway::new(store));
        let worker = Arc::new(Worker::new(
            registry,
            gateway.clone(),
            http,
            config.job_timeout,
        ));
        let scheduler = Scheduler::new(queue, worker, SchedulerConfig::from(&config));
        let trigger = TriggerService::new(scheduler.clone(), gateway.clone());
        Self {
            config,
            gateway,
            scheduler,
            trigger,
            pg: None,
        }
    }

    fn with_postgres(mut self, pg: PgStore) -> Self {
        self.pg = Some(pg);
        self
    }

    pub async fn migrate(&self) -> Result<()> {
        match &self.pg {
            Some(pg) => pg.migrate().await,
            None => {
                warn!("no database configured, nothing to migrate");
                Ok(())
            }
        }
    }

    /// Recurring jobs for every registered source, when the scheduler is enabled.
    pub async fn recurring(&self) -> Result<Option<RecurringJobs>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let recurring = RecurringJobs::new(self.scheduler.clone()).await?;
        let ids = self.scheduler.worker().registry().ids();
        recurring
            .add_for_sources(&self.config.sync_cron, ids)
            .await
            .with_context(|| format!("registering cron {}", self.config.sync_cron))?;
        Ok(Some(recurring))
    }
}
