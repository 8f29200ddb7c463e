//! Feed adapter contracts: page fetching, record normalization, pagination.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tevents_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod normalize;
pub mod pagination;
pub mod raw;

pub use normalize::{normalize, NormalizedListing};
pub use pagination::paginate;
pub use raw::RawListing;

pub const CRATE_NAME: &str = "tevents-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feed page {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("no fixture page registered for {0}")]
    UnknownFixture(String),
}

/// One page of search results plus the cursor for the following page.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub url: String,
    pub listings: Vec<RawListing>,
    /// `None` once the feed is exhausted; blank cursors are folded to `None`.
    pub next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(rename = "searchHits")]
    search_hits: Option<JsonValue>,
    #[serde(rename = "nextPageQuery", default)]
    next_page_query: Option<JsonValue>,
}

/// Decodes a search response body. A body without a `searchHits` array is malformed.
pub fn parse_page(url: &str, body: &[u8]) -> Result<FeedPage, AdapterError> {
    let envelope: PageEnvelope =
        serde_json::from_slice(body).map_err(|e| AdapterError::Malformed {
            url: url.to_string(),
            reason: format!("invalid JSON body: {e}"),
        })?;

    let Some(JsonValue::Array(hits)) = envelope.search_hits else {
        return Err(AdapterError::Malformed {
            url: url.to_string(),
            reason: "expected `searchHits` to be an array".to_string(),
        });
    };

    let next_page = match envelope.next_page_query {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    };

    Ok(FeedPage {
        url: url.to_string(),
        listings: hits.into_iter().map(RawListing::from_json).collect(),
        next_page,
    })
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<FeedPage, AdapterError>;
}

/// Live fetcher for the open-data search endpoint.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    http: HttpFetcher,
}

impl HttpPageFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<FeedPage, AdapterError> {
        let resp = self.http.fetch_bytes(run_id, url).await?;
        debug!(url, bytes = resp.body.len(), "fetched feed page");
        parse_page(url, &resp.body)
    }
}

/// Serves canned page bodies by URL and records every fetch.
#[derive(Debug, Default)]
pub struct FixturePageFetcher {
    pages: HashMap<String, Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl FixturePageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.pages.insert(url.into(), body.into());
        self
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched_urls().len()
    }
}

#[async_trait]
impl PageFetcher for FixturePageFetcher {
    async fn fetch_page(&self, _run_id: Uuid, url: &str) -> Result<FeedPage, AdapterError> {
        self.fetched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());
        let body = self
            .pages
            .get(url)
            .ok_or_else(|| AdapterError::UnknownFixture(url.to_string()))?;
        parse_page(url, body)
    }
}

/// Maps feed URLs to page files stored next to the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct FixtureManifest {
    pub source_id: String,
    pub start_url: String,
    pub pages: BTreeMap<String, String>,
}

pub fn load_fixture_feed(
    manifest_path: impl AsRef<Path>,
) -> Result<(FixtureManifest, FixturePageFetcher)> {
    let manifest_path = manifest_path.as_ref();
    let text = fs::read_to_string(manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let manifest: FixtureManifest = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", manifest_path.display()))?;

    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let mut fetcher = FixturePageFetcher::new();
    for (url, file) in &manifest.pages {
        let page_path = base.join(file);
        let body = fs::read(&page_path)
            .with_context(|| format!("reading fixture page {}", page_path.display()))?;
        fetcher = fetcher.with_page(url.clone(), body);
    }
    Ok((manifest, fetcher))
}
