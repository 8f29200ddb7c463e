//! Pure field normalization from raw feed records to canonical attributes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tevents_core::{
    CanonicalEvent, Category, GeoPoint, NO_DESCRIPTION, NO_TYPE, UNKNOWN_VENUE, UNTITLED_EVENT,
};

use crate::raw::RawListing;

/// Lower-cased source type labels and the category each maps to.
pub const CATEGORY_TABLE: [(&str, Category); 6] = [
    ("cultura", Category::Cultural),
    ("sport", Category::Sport),
    ("musica", Category::Music),
    ("enogastronomia", Category::Food),
    ("arte e mostre", Category::Art),
    ("feste, mercati e fiere", Category::Events),
];

/// A raw listing with every field resolved to its canonical shape.
///
/// Identity and start time stay optional: whether the record is admitted is
/// decided by the reconciliation pass, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub external_id: Option<String>,
    pub title: String,
    pub description: String,
    pub start_time: Option<DateTime<Utc>>,
    pub location: GeoPoint,
    pub venue_name: String,
    #[serde(with = "tevents_core::category_or_empty")]
    pub category: Option<Category>,
    pub original_type: String,
}

impl NormalizedListing {
    /// Builds the persisted event once identity and start time are known.
    pub fn into_event(self, external_id: String, start_time: DateTime<Utc>) -> CanonicalEvent {
        CanonicalEvent {
            external_id,
            title: self.title,
            description: self.description,
            start_time,
            location: self.location,
            venue_name: self.venue_name,
            category: self.category,
            original_type: self.original_type,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn category_for_label(label: &str) -> Option<Category> {
    let lower = label.to_lowercase();
    CATEGORY_TABLE
        .iter()
        .find(|(source, _)| *source == lower)
        .map(|(_, category)| *category)
}

/// Complete tags only; a `<` with no closing `>` is prose.
static MARKUP_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));

/// Strips markup, folds non-breaking spaces and whitespace runs into single
/// spaces, and falls back to the placeholder when nothing readable remains.
pub fn clean_description(text: Option<&str>) -> String {
    let Some(text) = non_empty(text) else {
        return NO_DESCRIPTION.to_string();
    };
    let untagged = MARKUP_TAG.replace_all(text, "").replace('<', "&lt;");
    let fragment = Html::parse_fragment(&untagged);
    let stripped = fragment.root_element().text().collect::<String>();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        NO_DESCRIPTION.to_string()
    } else {
        collapsed
    }
}

/// Parses the timestamp shapes the feed emits. Values without an offset are
/// read as UTC.
pub fn parse_source_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// The explicit start time when present, otherwise the publication timestamp.
/// A chosen value that does not parse yields `None`; there is no second fallback.
pub fn effective_start_time(listing: &RawListing) -> Option<DateTime<Utc>> {
    non_empty(listing.data.ita.from_time.as_deref())
        .or_else(|| non_empty(listing.metadata.published.as_deref()))
        .and_then(parse_source_datetime)
}

pub fn extract_location(listing: &RawListing) -> GeoPoint {
    let gps = listing.data.ita.gps.as_ref();
    GeoPoint {
        lat: gps.and_then(|g| g.latitude).unwrap_or(0.0),
        lng: gps.and_then(|g| g.longitude).unwrap_or(0.0),
    }
}

pub fn normalize(listing: &RawListing) -> NormalizedListing {
    let data = &listing.data.ita;
    let original_type = non_empty(listing.type_label()).unwrap_or(NO_TYPE);

    NormalizedListing {
        external_id: non_empty(listing.metadata.id.as_deref()).map(ToString::to_string),
        title: non_empty(data.titolo.as_deref())
            .unwrap_or(UNTITLED_EVENT)
            .to_string(),
        description: clean_description(data.abstract_text.as_deref()),
        start_time: effective_start_time(listing),
        location: extract_location(listing),
        venue_name: non_empty(data.luogo_svolgimento.as_deref())
            .unwrap_or(UNKNOWN_VENUE)
            .to_string(),
        category: category_for_label(original_type),
        original_type: original_type.to_string(),
    }
}
