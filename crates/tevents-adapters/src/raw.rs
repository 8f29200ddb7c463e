//! Loosely-typed feed records as served by the open-data search endpoint.
//!
//! Every field is optional and a value of the wrong JSON type reads as absent,
//! so a single odd record never fails the page it arrived on.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

/// One search hit: a metadata block plus the Italian-localized data block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawListing {
    #[serde(default, deserialize_with = "or_default")]
    pub metadata: RawMetadata,
    #[serde(default, deserialize_with = "or_default")]
    pub data: RawLocalized,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawMetadata {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub published: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawLocalized {
    #[serde(rename = "ita-IT", default, deserialize_with = "or_default")]
    pub ita: RawListingData,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawListingData {
    #[serde(default, deserialize_with = "lenient_string")]
    pub titolo: Option<String>,
    #[serde(rename = "abstract", default, deserialize_with = "lenient_string")]
    pub abstract_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub from_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_items")]
    pub tipo_evento: Vec<RawTypeTag>,
    #[serde(default, deserialize_with = "or_default")]
    pub gps: Option<RawGeo>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub luogo_svolgimento: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawTypeTag {
    #[serde(default, deserialize_with = "or_default")]
    pub name: RawLocalizedName,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawLocalizedName {
    #[serde(rename = "ita-IT", default, deserialize_with = "lenient_string")]
    pub ita: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawGeo {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub longitude: Option<f64>,
}

impl RawListing {
    pub fn from_json(value: JsonValue) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// Label of the first type tag, if any.
    pub fn type_label(&self) -> Option<&str> {
        self.data
            .ita
            .tipo_evento
            .first()
            .and_then(|tag| tag.name.ita.as_deref())
    }
}

fn or_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(de)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// A non-array reads as empty; a malformed element reads as its default and
/// keeps its position.
fn lenient_items<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(match JsonValue::deserialize(de)? {
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).unwrap_or_default())
            .collect(),
        _ => Vec::new(),
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match JsonValue::deserialize(de)? {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
    let parsed = match JsonValue::deserialize(de)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(parsed.filter(|v| v.is_finite()))
}
