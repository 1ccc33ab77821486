use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use disco_core::{CanonicalEvent, Price, RawItem, SourceConfig, Venue};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{str_field, text_or_none};
use crate::{Source, SourceContext, SourceError};

/// Hand-maintained venue events, declared inline under `options.events` or in
/// a JSON array file at `options.path`. Makes no outbound calls.
pub struct CuratedVenuesSource {
    config: SourceConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CuratedEntry {
    title: Option<String>,
    description: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    venue: Venue,
    category: Option<String>,
    tags: Vec<String>,
    image_url: Option<String>,
    url: Option<String>,
    price: Price,
}

impl CuratedVenuesSource {
    pub const KIND: &'static str = "curated_venues";

    pub fn build(config: SourceConfig) -> Result<Arc<dyn Source>, SourceError> {
        let has_inline = config.options.get("events").is_some_and(JsonValue::is_array);
        if !has_inline && config.option_str("path").is_none() {
            return Err(SourceError::config(
                &config.id,
                "curated source needs options.events or options.path",
            ));
        }
        Ok(Arc::new(Self { config }))
    }

    async fn entries(&self) -> Result<Vec<JsonValue>, SourceError> {
        if let Some(events) = self.config.options.get("events").and_then(JsonValue::as_array) {
            return Ok(events.clone());
        }
        let Some(path) = self.config.option_str("path").map(PathBuf::from) else {
            return Ok(Vec::new());
        };
        let data = tokio::fs::read_to_string(&path).await.map_err(|err| {
            SourceError::config(&self.config.id, format!("reading {}: {err}", path.display()))
        })?;
        let parsed: JsonValue = serde_json::from_str(&data).map_err(|err| SourceError::Upstream {
            source_id: self.config.id.clone(),
            message: format!("parsing {}: {err}", path.display()),
        })?;
        match parsed {
            JsonValue::Array(events) => Ok(events),
            JsonValue::Object(mut obj) => Ok(obj
                .remove("events")
                .and_then(|v| match v {
                    JsonValue::Array(events) => Some(events),
                    _ => None,
                })
                .unwrap_or_default()),
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Source for CuratedVenuesSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn authenticate(&self, _ctx: &SourceContext) -> Result<(), SourceError> {
        Ok(())
    }

    async fn fetch_events(
        &self,
        ctx: &SourceContext,
        _params: &JsonValue,
    ) -> Result<Vec<RawItem>, SourceError> {
        let entries = self.entries().await?;
        debug!(source_id = %self.config.id, count = entries.len(), "loaded curated entries");
        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| RawItem {
                source_id: self.config.id.clone(),
                external_id: str_field(&entry, "id").unwrap_or_else(|| format!("entry-{idx}")),
                raw_payload: entry,
                fetched_at: ctx.fetched_at,
            })
            .collect())
    }

    fn validate_response(&self, raw: &JsonValue) -> bool {
        let has_start = raw
            .get("start_time")
            .and_then(JsonValue::as_str)
            .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok());
        str_field(raw, "id").is_some() && str_field(raw, "title").is_some() && has_start
    }

    fn transform(&self, item: &RawItem) -> CanonicalEvent {
        let entry: CuratedEntry =
            serde_json::from_value(item.raw_payload.clone()).unwrap_or_default();
        CanonicalEvent {
            title: entry
                .title
                .as_deref()
                .and_then(text_or_none)
                .unwrap_or_else(|| item.external_id.clone()),
            description: entry.description,
            start_time: entry.start_time.unwrap_or(item.fetched_at),
            end_time: entry.end_time,
            venue: entry.venue,
            category: entry.category,
            tags: entry.tags,
            image_url: entry.image_url,
            external_url: entry.url,
            price: entry.price,
        }
    }
}
