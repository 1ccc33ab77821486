//! Venue calendar pages scraped with CSS selectors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use disco_core::{CanonicalEvent, Price, PriceType, RawItem, SourceConfig, Venue};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::{str_field, text_or_none};
use crate::{Source, SourceContext, SourceError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarSelectors {
    pub item: String,
    pub title: String,
    pub start: String,
    pub link: String,
    pub description: String,
    pub location: String,
    pub image: String,
}

impl Default for CalendarSelectors {
    fn default() -> Self {
        Self {
            item: ".event".into(),
            title: ".event-title".into(),
            start: "time".into(),
            link: "a[href]".into(),
            description: ".event-description".into(),
            location: ".event-location".into(),
            image: "img[src]".into(),
        }
    }
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    start: Selector,
    link: Selector,
    description: Selector,
    location: Selector,
    image: Selector,
}

impl CalendarSelectors {
    fn compile(&self) -> Result<CompiledSelectors, String> {
        let parse = |css: &str| Selector::parse(css).map_err(|e| format!("selector {css:?}: {e}"));
        Ok(CompiledSelectors {
            item: parse(&self.item)?,
            title: parse(&self.title)?,
            start: parse(&self.start)?,
            link: parse(&self.link)?,
            description: parse(&self.description)?,
            location: parse(&self.location)?,
            image: parse(&self.image)?,
        })
    }
}

pub struct VenueCalendarSource {
    config: SourceConfig,
    url: String,
    selectors: CalendarSelectors,
}

impl VenueCalendarSource {
    pub const KIND: &'static str = "venue_calendar";

    pub fn build(config: SourceConfig) -> Result<Arc<dyn Source>, SourceError> {
        let url = config
            .option_str("url")
            .ok_or_else(|| SourceError::config(&config.id, "options.url is required"))?
            .to_string();
        let selectors: CalendarSelectors = match config.options.get("selectors") {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|err| SourceError::config(&config.id, err.to_string()))?,
            None => CalendarSelectors::default(),
        };
        selectors
            .compile()
            .map_err(|message| SourceError::config(&config.id, message))?;
        Ok(Arc::new(Self {
            config,
            url,
            selectors,
        }))
    }
}

fn first_text(scope: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

fn first_attr(scope: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

/// Resolves a link against the page url. Links that cannot be resolved are
/// kept as written.
fn absolutize(page_url: &str, href: &str) -> String {
    Url::parse(page_url)
        .and_then(|base| base.join(href.trim()))
        .map(String::from)
        .unwrap_or_else(|_| href.to_string())
}

/// Extracts one JSON payload per calendar entry. Synchronous because the
/// parsed document cannot be held across an await.
pub(crate) fn parse_listing(
    html: &str,
    selectors: &CalendarSelectors,
    page_url: &str,
) -> Result<Vec<JsonValue>, String> {
    let compiled = selectors.compile()?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&compiled.item)
        .map(|entry| {
            let start = first_attr(&entry, &compiled.start, "datetime")
                .or_else(|| first_text(&entry, &compiled.start));
            json!({
                "title": first_text(&entry, &compiled.title),
                "start": start,
                "link": first_attr(&entry, &compiled.link, "href").map(|h| absolutize(page_url, &h)),
                "description": first_text(&entry, &compiled.description),
                "location": first_text(&entry, &compiled.location),
                "image": first_attr(&entry, &compiled.image, "src").map(|s| absolutize(page_url, &s)),
            })
        })
        .collect())
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM[:SS]` (read as UTC) or a bare date.
pub(crate) fn parse_start(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) fn external_id_for(entry: &JsonValue) -> String {
    if let Some(link) = str_field(entry, "link") {
        return link;
    }
    let key = format!(
        "{}|{}",
        str_field(entry, "title").unwrap_or_default(),
        str_field(entry, "start").unwrap_or_default()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

#[async_trait]
impl Source for VenueCalendarSource {
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
        let page = ctx
            .get(&self.url, &[])
            .await
            .map_err(|err| SourceError::from_fetch(&self.config.id, err))?;
        let entries = parse_listing(&page.text(), &self.selectors, &self.url)
            .map_err(|message| SourceError::config(&self.config.id, message))?;
        debug!(source_id = %self.config.id, count = entries.len(), "parsed calendar page");

        Ok(entries
            .into_iter()
            .map(|entry| RawItem {
                source_id: self.config.id.clone(),
                external_id: external_id_for(&entry),
                raw_payload: entry,
                fetched_at: ctx.fetched_at,
            })
            .collect())
    }

    fn validate_response(&self, raw: &JsonValue) -> bool {
        str_field(raw, "title").is_some()
            && str_field(raw, "start").as_deref().and_then(parse_start).is_some()
    }

    fn transform(&self, item: &RawItem) -> CanonicalEvent {
        let raw = &item.raw_payload;
        let price = match self.config.option_str("price").map(str::to_ascii_lowercase) {
            Some(p) if p == "free" => PriceType::Free,
            Some(p) if p == "paid" => PriceType::Paid,
            _ => PriceType::Unknown,
        };
        CanonicalEvent {
            title: str_field(raw, "title").unwrap_or_else(|| item.external_id.clone()),
            description: str_field(raw, "description"),
            start_time: str_field(raw, "start")
                .as_deref()
                .and_then(parse_start)
                .unwrap_or(item.fetched_at),
            end_time: None,
            venue: Venue {
                name: self.config.option_str("venue_name").map(str::to_string),
                address: str_field(raw, "location")
                    .or_else(|| self.config.option_str("venue_address").map(str::to_string)),
                lat: self.config.option_f64("lat"),
                lng: self.config.option_f64("lng"),
            },
            category: self.config.option_str("category").map(str::to_string),
            tags: Vec::new(),
            image_url: str_field(raw, "image"),
            external_url: str_field(raw, "link"),
            price: Price {
                kind: price,
                amount: None,
                currency: None,
            },
        }
    }
}
