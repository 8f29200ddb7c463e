//! Core domain model for the Trento events ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tevents-core";

pub const UNTITLED_EVENT: &str = "Untitled Event";
pub const NO_DESCRIPTION: &str = "No description available";
pub const UNKNOWN_VENUE: &str = "Unknown location";
pub const NO_TYPE: &str = "No type";

/// Closed set of semantic categories an event can be classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Cultural,
    Sport,
    Music,
    Food,
    Art,
    Events,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Cultural,
        Category::Sport,
        Category::Music,
        Category::Food,
        Category::Art,
        Category::Events,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Cultural => "cultural",
            Category::Sport => "sport",
            Category::Music => "music",
            Category::Food => "food",
            Category::Art => "art",
            Category::Events => "events",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Map coordinates. Both axes are always present; unknown positions are `0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Persisted event, keyed by the source-assigned `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub location: GeoPoint,
    pub venue_name: String,
    /// `None` when the source label has no mapping; serialized as `""`.
    #[serde(with = "category_or_empty")]
    pub category: Option<Category>,
    pub original_type: String,
}

impl CanonicalEvent {
    /// An event is stale once its start time is strictly before `reference`.
    pub fn is_stale_at(&self, reference: DateTime<Utc>) -> bool {
        self.start_time < reference
    }

    pub fn category_str(&self) -> &'static str {
        self.category.map(Category::as_str).unwrap_or("")
    }
}

/// Serde adapter storing an optional category as its label or the empty string.
pub mod category_or_empty {
    use super::Category;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Category>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(value.map(Category::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Category>, D::Error> {
        let raw = String::deserialize(de)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(D::Error::custom)
    }
}
