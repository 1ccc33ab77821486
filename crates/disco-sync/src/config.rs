use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use disco_core::SourceConfig;
use serde::Deserialize;
use tokio::fs;

use crate::policy::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Unset means in-memory storage and queue.
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub worker_pool: usize,
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub poll_interval: Duration,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_file: PathBuf::from("sources.yaml"),
            scheduler_enabled: false,
            sync_cron: "0 */6 * * *".to_string(),
            worker_pool: 4,
            job_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(20),
            user_agent: "disco-bot/0.1".to_string(),
            poll_interval: Duration::from_millis(1000),
            web_port: 8000,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy {
            base_delay: env_parse("DISCO_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            multiplier: env_parse("DISCO_BACKOFF_MULTIPLIER").unwrap_or(defaults.retry.multiplier),
            max_attempts: env_parse("DISCO_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
        };
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            sources_file: std::env::var("DISCO_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            scheduler_enabled: env_flag("DISCO_SCHEDULER_ENABLED").unwrap_or(false),
            sync_cron: std::env::var("DISCO_SYNC_CRON").unwrap_or(defaults.sync_cron),
            worker_pool: env_parse::<usize>("DISCO_WORKER_POOL")
                .unwrap_or(defaults.worker_pool)
                .max(1),
            job_timeout: env_parse("DISCO_JOB_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            retry,
            http_timeout: env_parse("DISCO_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            user_agent: std::env::var("DISCO_USER_AGENT").unwrap_or(defaults.user_agent),
            poll_interval: env_parse("DISCO_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            web_port: env_parse("DISCO_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }
}

/// Static source declarations, read once at process start.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<SourceConfig>,
}

impl SourcesFile {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: Self = serde_yaml::from_str(text)?;
        let mut seen = HashSet::new();
        for source in &file.sources {
            if source.id.trim().is_empty() {
                bail!("source with empty id");
            }
            if !seen.insert(source.id.as_str()) {
                bail!("duplicate source id {}", source.id);
            }
        }
        Ok(file)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
