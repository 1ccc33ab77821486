//! Places-directory provider: a nearby search followed by one detail lookup
//! per place.
//!
//! Payloads follow the Google Places web service shape (`status`, `results`,
//! `result`, `opening_hours.periods`, `utc_offset`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use disco_core::{CanonicalEvent, Price, PriceType, RawItem, SourceConfig, Venue};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{setting_f64, setting_str, str_field};
use crate::{Source, SourceContext, SourceError};

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_RADIUS_M: f64 = 2000.0;
const DEFAULT_MAX_DETAILS: u64 = 20;
const DETAIL_FIELDS: &str = "place_id,name,formatted_address,vicinity,geometry,types,\
opening_hours,utc_offset,price_level,photos,website,url,editorial_summary";

pub struct PlacesApiSource {
    config: SourceConfig,
    base_url: String,
}

impl PlacesApiSource {
    pub const KIND: &'static str = "places_api";

    pub fn new(config: SourceConfig) -> Self {
        let base_url = config
            .option_str("base_url")
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self { config, base_url }
    }

    pub fn build(config: SourceConfig) -> Result<Arc<dyn Source>, SourceError> {
        if config.credentials_env.is_none() {
            warn!(source_id = %config.id, "places source has no credentials_env; it will fetch nothing");
        }
        Ok(Arc::new(Self::new(config)))
    }

    fn check_status(&self, body: &JsonValue) -> Result<(), SourceError> {
        let status = body.get("status").and_then(JsonValue::as_str).unwrap_or("OK");
        let message = body
            .get("error_message")
            .and_then(JsonValue::as_str)
            .unwrap_or(status)
            .to_string();
        let source_id = self.config.id.clone();
        match status {
            "OK" | "ZERO_RESULTS" => Ok(()),
            "REQUEST_DENIED" => Err(SourceError::Auth { source_id, message }),
            "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => {
                Err(SourceError::TransientFetch { source_id, message })
            }
            "INVALID_REQUEST" => Err(SourceError::InvalidParams { source_id, message }),
            _ => Err(SourceError::Upstream { source_id, message }),
        }
    }

    async fn nearby_search(
        &self,
        ctx: &SourceContext,
        key: &str,
        params: &JsonValue,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let lat = setting_f64(params, &self.config, "lat")
            .ok_or_else(|| SourceError::invalid_params(&self.config.id, "lat is required"))?;
        let lng = setting_f64(params, &self.config, "lng")
            .ok_or_else(|| SourceError::invalid_params(&self.config.id, "lng is required"))?;
        let radius = setting_f64(params, &self.config, "radius").unwrap_or(DEFAULT_RADIUS_M);

        let mut query = vec![
            ("location".to_string(), format!("{lat},{lng}")),
            ("radius".to_string(), format!("{}", radius.round() as u64)),
            ("key".to_string(), key.to_string()),
        ];
        if let Some(place_type) = setting_str(params, &self.config, "type") {
            query.push(("type".to_string(), place_type.to_string()));
        }

        let url = format!("{}/nearbysearch/json", self.base_url);
        let body = ctx
            .get(&url, &query)
            .await
            .and_then(|resp| resp.json())
            .map_err(|err| SourceError::from_fetch(&self.config.id, err))?;
        self.check_status(&body)?;

        Ok(body
            .get("results")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Detail payload for one place, or `None` when the lookup failed.
    async fn place_details(
        &self,
        ctx: &SourceContext,
        key: &str,
        place_id: &str,
    ) -> Option<JsonValue> {
        let url = format!("{}/details/json", self.base_url);
        let query = [
            ("place_id".to_string(), place_id.to_string()),
            ("fields".to_string(), DETAIL_FIELDS.to_string()),
            ("key".to_string(), key.to_string()),
        ];
        let outcome = ctx
            .get(&url, &query)
            .await
            .and_then(|resp| resp.json())
            .map_err(|err| SourceError::from_fetch(&self.config.id, err))
            .and_then(|body| self.check_status(&body).map(|()| body));

        match outcome {
            Ok(mut body) => body.get_mut("result").map(JsonValue::take),
            Err(err) => {
                warn!(source_id = %self.config.id, place_id, error = %err, "detail lookup failed, keeping search summary");
                None
            }
        }
    }

    fn photo_url(&self, raw: &JsonValue) -> Option<String> {
        let reference = raw
            .get("photos")?
            .as_array()?
            .first()?
            .get("photo_reference")?
            .as_str()?;
        Some(format!(
            "{}/photo?maxwidth=800&photo_reference={reference}",
            self.base_url
        ))
    }
}

#[async_trait]
impl Source for PlacesApiSource {
    fn config(&self) -> &SourceConfig {
        &self.config
    }

    async fn authenticate(&self, ctx: &SourceContext) -> Result<(), SourceError> {
        match ctx.credentials() {
            Some(_) => Ok(()),
            None => Err(SourceError::config(
                &self.config.id,
                format!(
                    "api key missing (env {})",
                    self.config.credentials_env.as_deref().unwrap_or("<unset>")
                ),
            )),
        }
    }

    async fn fetch_events(
        &self,
        ctx: &SourceContext,
        params: &JsonValue,
    ) -> Result<Vec<RawItem>, SourceError> {
        let Some(key) = ctx.credentials() else {
            warn!(source_id = %self.config.id, "api key missing, returning no items");
            return Ok(Vec::new());
        };

        let summaries = self.nearby_search(ctx, key, params).await?;
        let max_details = params
            .get("max_details")
            .and_then(JsonValue::as_u64)
            .or_else(|| self.config.option_u64("max_details"))
            .unwrap_or(DEFAULT_MAX_DETAILS);
        debug!(source_id = %self.config.id, found = summaries.len(), "nearby search complete");

        let mut items = Vec::with_capacity(summaries.len());
        for (idx, summary) in summaries.into_iter().enumerate() {
            let place_id = str_field(&summary, "place_id");
            let payload = match place_id.as_deref() {
                Some(id) if (idx as u64) < max_details => self
                    .place_details(ctx, key, id)
                    .await
                    .unwrap_or_else(|| summary.clone()),
                _ => summary,
            };
            items.push(RawItem {
                source_id: self.config.id.clone(),
                external_id: place_id.unwrap_or_else(|| format!("unidentified-{idx}")),
                raw_payload: payload,
                fetched_at: ctx.fetched_at,
            });
        }
        Ok(items)
    }

    fn validate_response(&self, raw: &JsonValue) -> bool {
        str_field(raw, "place_id").is_some() && str_field(raw, "name").is_some()
    }

    fn transform(&self, item: &RawItem) -> CanonicalEvent {
        let raw = &item.raw_payload;
        let name = str_field(raw, "name");
        let location = raw.get("geometry").and_then(|g| g.get("location"));
        let types: Vec<String> = raw
            .get("types")
            .and_then(JsonValue::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let (start_time, end_time) = match next_opening(raw, item.fetched_at) {
            Some((start, end)) => (start, end),
            None => (item.fetched_at, None),
        };

        CanonicalEvent {
            title: name.clone().unwrap_or_else(|| item.external_id.clone()),
            description: raw
                .get("editorial_summary")
                .and_then(|s| str_field(s, "overview")),
            start_time,
            end_time,
            venue: Venue {
                name,
                address: str_field(raw, "formatted_address").or_else(|| str_field(raw, "vicinity")),
                lat: location.and_then(|l| l.get("lat")).and_then(JsonValue::as_f64),
                lng: location.and_then(|l| l.get("lng")).and_then(JsonValue::as_f64),
            },
            category: Some(map_category(&types).to_string()),
            tags: types,
            image_url: self.photo_url(raw),
            external_url: str_field(raw, "website").or_else(|| str_field(raw, "url")),
            price: price_from_level(raw.get("price_level").and_then(JsonValue::as_u64)),
        }
    }
}

/// First provider place type with a known mapping decides the category.
pub fn map_category(types: &[String]) -> &'static str {
    types
        .iter()
        .find_map(|t| match t.as_str() {
            "restaurant" | "cafe" | "bakery" | "meal_takeaway" => Some("dining"),
            "bar" | "night_club" => Some("nightlife"),
            "museum" | "art_gallery" => Some("arts"),
            "park" => Some("outdoors"),
            "movie_theater" | "bowling_alley" | "amusement_park" => Some("entertainment"),
            "gym" => Some("fitness"),
            _ => None,
        })
        .unwrap_or("other")
}

fn price_from_level(level: Option<u64>) -> Price {
    let kind = match level {
        Some(0) => PriceType::Free,
        Some(_) => PriceType::Paid,
        None => PriceType::Unknown,
    };
    Price {
        kind,
        amount: None,
        currency: None,
    }
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    if value.len() != 4 {
        return None;
    }
    let hours = value.get(0..2)?.parse().ok()?;
    let minutes = value.get(2..4)?.parse().ok()?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
}

fn period_point(point: &JsonValue) -> Option<(u32, NaiveTime)> {
    let day = u32::try_from(point.get("day")?.as_u64()?).ok().filter(|d| *d < 7)?;
    let time = parse_hhmm(point.get("time")?.as_str()?)?;
    Some((day, time))
}

/// Next occurrence at or after `from` of weekday `day` (0 = Sunday) at `time`.
fn next_occurrence(from: NaiveDateTime, day: u32, time: NaiveTime) -> NaiveDateTime {
    let today = from.date().weekday().num_days_from_sunday();
    let ahead = (day + 7 - today) % 7;
    let date: NaiveDate = from.date() + Duration::days(i64::from(ahead));
    let candidate = date.and_time(time);
    if candidate < from {
        candidate + Duration::days(7)
    } else {
        candidate
    }
}

/// Start and end of the next posted opening after `fetched_at`, in UTC.
fn next_opening(
    raw: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Option<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let periods = raw.get("opening_hours")?.get("periods")?.as_array()?;
    let offset = Duration::minutes(
        raw.get("utc_offset")
            .or_else(|| raw.get("utc_offset_minutes"))
            .and_then(JsonValue::as_i64)
            .unwrap_or(0),
    );
    let local_now = (fetched_at + offset).naive_utc();

    let mut best: Option<(NaiveDateTime, Option<NaiveDateTime>)> = None;
    for period in periods {
        let Some((open_day, open_time)) = period.get("open").and_then(period_point) else {
            continue;
        };
        let opens = next_occurrence(local_now, open_day, open_time);
        let closes = period
            .get("close")
            .and_then(period_point)
            .map(|(close_day, close_time)| {
                let close = next_occurrence(opens, close_day, close_time);
                if close <= opens {
                    close + Duration::days(7)
                } else {
                    close
                }
            });
        if best.map_or(true, |(current, _)| opens < current) {
            best = Some((opens, closes));
        }
    }

    best.map(|(opens, closes)| {
        (
            opens.and_utc() - offset,
            closes.map(|c| c.and_utc() - offset),
        )
    })
}
