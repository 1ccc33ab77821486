mod calendar;
mod curated;
mod places;

pub use calendar::VenueCalendarSource;
pub use curated::CuratedVenuesSource;
pub use places::{map_category, PlacesApiSource};

use disco_core::SourceConfig;
use serde_json::Value as JsonValue;

/// Job params win over the static options of the source config.
pub(crate) fn setting<'a>(
    params: &'a JsonValue,
    config: &'a SourceConfig,
    key: &str,
) -> Option<&'a JsonValue> {
    params
        .get(key)
        .filter(|value| !value.is_null())
        .or_else(|| config.options.get(key).filter(|value| !value.is_null()))
}

pub(crate) fn setting_f64(params: &JsonValue, config: &SourceConfig, key: &str) -> Option<f64> {
    setting(params, config, key).and_then(JsonValue::as_f64)
}

pub(crate) fn setting_str<'a>(
    params: &'a JsonValue,
    config: &'a SourceConfig,
    key: &str,
) -> Option<&'a str> {
    setting(params, config, key).and_then(JsonValue::as_str)
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn str_field(raw: &JsonValue, key: &str) -> Option<String> {
    raw.get(key).and_then(JsonValue::as_str).and_then(text_or_none)
}
