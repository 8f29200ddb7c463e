use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tevents_adapters::{normalize, paginate, AdapterError, FeedPage, NormalizedListing, PageFetcher};
use tevents_core::CanonicalEvent;
use tevents_storage::{EventFilter, EventStore, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Why a feed record was left out of the store. Skips are not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingExternalId,
    UnparseableDate,
    PastEvent,
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error("feed fetch failed: {0}")]
    TransientFetch(#[source] AdapterError),
    #[error("feed response malformed: {0}")]
    MalformedResponse(#[source] AdapterError),
    #[error("event store write failed: {0}")]
    StoreWrite(#[from] StoreError),
}

impl From<AdapterError> for PassError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Malformed { .. } => Self::MalformedResponse(err),
            AdapterError::Fetch(_) | AdapterError::UnknownFixture(_) => Self::TransientFetch(err),
        }
    }
}

impl PassError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::TransientFetch(_) => FailureKind::TransientFetch,
            Self::MalformedResponse(_) => FailureKind::MalformedResponse,
            Self::StoreWrite(_) => FailureKind::StoreWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientFetch,
    MalformedResponse,
    StoreWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Pruning,
    Paginating,
    Completed,
    Failed,
}

/// `Reset` clears the whole store before paginating; `Incremental` only
/// prunes events that already started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    Incremental,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    Failed {
        phase: PassState,
        kind: FailureKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub page_no: usize,
    pub url: String,
    pub hits: usize,
    pub upserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub run_id: Uuid,
    pub mode: PassMode,
    pub reference_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pruned: u64,
    pub pages: Vec<PageReport>,
    pub upserted: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub outcome: PassOutcome,
}

impl PassReport {
    fn new(run_id: Uuid, mode: PassMode, reference_time: DateTime<Utc>) -> Self {
        let started_at = Utc::now();
        Self {
            run_id,
            mode,
            reference_time,
            started_at,
            finished_at: started_at,
            pruned: 0,
            pages: Vec::new(),
            upserted: 0,
            skipped: BTreeMap::new(),
            outcome: PassOutcome::Completed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PassOutcome::Completed
    }

    pub fn total_hits(&self) -> usize {
        self.pages.iter().map(|p| p.hits).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }
}

/// Decides whether a normalized record may be stored as of `reference_time`.
pub fn admit(
    mut listing: NormalizedListing,
    reference_time: DateTime<Utc>,
) -> Result<CanonicalEvent, SkipReason> {
    let external_id = listing
        .external_id
        .take()
        .ok_or(SkipReason::MissingExternalId)?;
    let start_time = listing.start_time.ok_or(SkipReason::UnparseableDate)?;
    let event = listing.into_event(external_id, start_time);
    if event.is_stale_at(reference_time) {
        return Err(SkipReason::PastEvent);
    }
    Ok(event)
}

/// Runs prune-then-paginate-then-upsert passes against one feed and one store.
///
/// A pass never returns an error: every failure is logged and folded into
/// the returned [`PassReport`], and writes committed before the failure stay.
pub struct SyncPipeline {
    feed_url: String,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn EventStore>,
    state: watch::Sender<PassState>,
}

impl SyncPipeline {
    pub fn new(
        feed_url: impl Into<String>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let (state, _) = watch::channel(PassState::Idle);
        Self {
            feed_url: feed_url.into(),
            fetcher,
            store,
            state,
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> PassState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PassState> {
        self.state.subscribe()
    }

    pub async fn run_pass(&self) -> PassReport {
        self.run(PassMode::Incremental, Utc::now()).await
    }

    pub async fn run_pass_at(&self, reference_time: DateTime<Utc>) -> PassReport {
        self.run(PassMode::Incremental, reference_time).await
    }

    pub async fn reset_and_sync(&self) -> PassReport {
        self.run(PassMode::Reset, Utc::now()).await
    }

    pub async fn run(&self, mode: PassMode, reference_time: DateTime<Utc>) -> PassReport {
        let run_id = Uuid::new_v4();
        self.execute(run_id, mode, reference_time)
            .instrument(info_span!("sync_pass", %run_id))
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        mode: PassMode,
        reference_time: DateTime<Utc>,
    ) -> PassReport {
        let mut report = PassReport::new(run_id, mode, reference_time);
        info!(?mode, %reference_time, feed_url = %self.feed_url, "sync pass started");

        let result = self.drive(run_id, &mut report).await;
        report.finished_at = Utc::now();

        match result {
            Ok(()) => {
                self.state.send_replace(PassState::Completed);
                info!(
                    pages = report.pages.len(),
                    pruned = report.pruned,
                    upserted = report.upserted,
                    skipped = report.total_skipped(),
                    "sync pass completed"
                );
            }
            Err(err) => {
                let phase = self.state.send_replace(PassState::Failed);
                error!(?phase, error = %err, upserted = report.upserted, "sync pass failed");
                report.outcome = PassOutcome::Failed {
                    phase,
                    kind: err.kind(),
                    message: err.to_string(),
                };
            }
        }

        self.state.send_replace(PassState::Idle);
        report
    }

    async fn drive(&self, run_id: Uuid, report: &mut PassReport) -> Result<(), PassError> {
        self.state.send_replace(PassState::Pruning);
        let filter = match report.mode {
            PassMode::Reset => EventFilter::All,
            PassMode::Incremental => EventFilter::StartsBefore(report.reference_time),
        };
        report.pruned = self.store.delete_many(&filter).await?;
        info!(pruned = report.pruned, "stale events pruned");

        self.state.send_replace(PassState::Paginating);
        let mut pages = paginate(Arc::clone(&self.fetcher), run_id, self.feed_url.clone());
        while let Some(page) = pages.next().await {
            let page = page?;
            let mut page_report = PageReport {
                page_no: report.pages.len() + 1,
                url: page.url.clone(),
                hits: page.listings.len(),
                upserted: 0,
                skipped: 0,
            };
            let result = self.reconcile_page(&page, report, &mut page_report).await;

            info!(
                page = page_report.page_no,
                hits = page_report.hits,
                upserted = page_report.upserted,
                skipped = page_report.skipped,
                "page reconciled"
            );
            report.upserted += page_report.upserted;
            report.pages.push(page_report);
            result?;
        }
        Ok(())
    }

    async fn reconcile_page(
        &self,
        page: &FeedPage,
        report: &mut PassReport,
        page_report: &mut PageReport,
    ) -> Result<(), PassError> {
        for raw in &page.listings {
            let listing = normalize(raw);
            let external_id = listing.external_id.clone();
            match admit(listing, report.reference_time) {
                Ok(event) => {
                    self.store.upsert(&event).await?;
                    page_report.upserted += 1;
                }
                Err(reason) => {
                    debug!(?reason, external_id = external_id.as_deref(), "record skipped");
                    page_report.skipped += 1;
                    *report.skipped.entry(reason).or_default() += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;
    use tevents_adapters::{load_fixture_feed, FixtureManifest, FixturePageFetcher};
    use tevents_core::GeoPoint;
    use tevents_storage::{FetchError, MemoryEventStore};

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap()
    }

    fn fixture_feed() -> (FixtureManifest, Arc<FixturePageFetcher>) {
        let path =
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/trento-opendata/manifest.json");
        let (manifest, fetcher) = load_fixture_feed(path).expect("load fixture feed");
        (manifest, Arc::new(fetcher))
    }

    fn event(external_id: &str, start_time: DateTime<Utc>) -> CanonicalEvent {
        CanonicalEvent {
            external_id: external_id.to_string(),
            title: "Seeded".to_string(),
            description: "Seeded".to_string(),
            start_time,
            location: GeoPoint::default(),
            venue_name: "Seeded".to_string(),
            category: None,
            original_type: "No type".to_string(),
        }
    }

    /// Fails every upsert for one external id.
    struct FailingStore {
        inner: MemoryEventStore,
        poison_id: &'static str,
    }

    #[async_trait]
    impl EventStore for FailingStore {
        async fn find(&self, filter: &EventFilter) -> Result<Vec<CanonicalEvent>, StoreError> {
            self.inner.find(filter).await
        }

        async fn upsert(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
            if event.external_id == self.poison_id {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.upsert(event).await
        }

        async fn delete_many(&self, filter: &EventFilter) -> Result<u64, StoreError> {
            self.inner.delete_many(filter).await
        }
    }

    #[tokio::test]
    async fn full_pass_reconciles_every_page() {
        let (manifest, fetcher) = fixture_feed();
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = SyncPipeline::new(manifest.start_url, fetcher.clone(), store.clone());

        let report = pipeline.run_pass_at(reference()).await;

        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(fetcher.fetch_count(), 3);
        assert_eq!(report.pages.len(), 3);
        assert_eq!(report.total_hits(), 9);
        assert_eq!(report.upserted, 6);
        assert_eq!(report.skipped_for(SkipReason::PastEvent), 1);
        assert_eq!(report.skipped_for(SkipReason::UnparseableDate), 1);
        assert_eq!(report.skipped_for(SkipReason::MissingExternalId), 1);
        assert!(report
            .pages
            .iter()
            .all(|p| p.hits == 3 && p.upserted == 2 && p.skipped == 1));

        let ids: Vec<String> = store
            .find(&EventFilter::All)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.external_id)
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, ["1002", "trn-1001", "trn-2001", "trn-3001", "trn-3003"]);
    }

    #[tokio::test]
    async fn repeated_record_is_updated_in_place() {
        let (manifest, fetcher) = fixture_feed();
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = SyncPipeline::new(manifest.start_url, fetcher, store.clone());

        pipeline.run_pass_at(reference()).await;

        let matches = store
            .find(&EventFilter::ExternalIds(vec!["trn-1001".to_string()]))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].title, "Festival dell'Economia 2030");
        assert_eq!(matches[0].description, "Programma aggiornato");
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_feed_is_idempotent() {
        let (manifest, fetcher) = fixture_feed();
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = SyncPipeline::new(manifest.start_url, fetcher, store.clone());

        pipeline.run_pass_at(reference()).await;
        let after_first = store.find(&EventFilter::All).await.unwrap();

        let second = pipeline.run_pass_at(reference()).await;
        let after_second = store.find(&EventFilter::All).await.unwrap();

        assert!(second.is_success());
        assert_eq!(second.pruned, 0);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn stale_events_are_pruned_before_paginating() {
        let (manifest, fetcher) = fixture_feed();
        let store = Arc::new(MemoryEventStore::new());
        store
            .upsert(&event("old", Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()))
            .await
            .unwrap();
        store.upsert(&event("boundary", reference())).await.unwrap();
        let pipeline = SyncPipeline::new(manifest.start_url, fetcher, store.clone());

        let report = pipeline.run_pass_at(reference()).await;

        assert_eq!(report.pruned, 1);
        let stored = store.find(&EventFilter::All).await.unwrap();
        assert!(stored.iter().all(|e| e.start_time >= reference()));
        assert!(stored.iter().any(|e| e.external_id == "boundary"));
        assert!(!stored.iter().any(|e| e.external_id == "old"));
    }

    #[tokio::test]
    async fn reset_clears_future_events_too() {
        let (manifest, fetcher) = fixture_feed();
        let store = Arc::new(MemoryEventStore::new());
        let far_future = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        store.upsert(&event("orphan", far_future)).await.unwrap();
        let pipeline = SyncPipeline::new(manifest.start_url, fetcher, store.clone());

        let report = pipeline.reset_and_sync().await;

        assert_eq!(report.mode, PassMode::Reset);
        assert_eq!(report.pruned, 1);
        let stored = store.find(&EventFilter::All).await.unwrap();
        assert!(!stored.iter().any(|e| e.external_id == "orphan"));
    }

    #[tokio::test]
    async fn store_failure_keeps_earlier_writes() {
        let (manifest, fetcher) = fixture_feed();
        let store = Arc::new(FailingStore {
            inner: MemoryEventStore::new(),
            poison_id: "trn-2001",
        });
        let pipeline = SyncPipeline::new(manifest.start_url, fetcher.clone(), store.clone());

        let report = pipeline.run_pass_at(reference()).await;

        match &report.outcome {
            PassOutcome::Failed { phase, kind, .. } => {
                assert_eq!(*phase, PassState::Paginating);
                assert_eq!(*kind, FailureKind::StoreWrite);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fetcher.fetch_count(), 2);
        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.pages[1].upserted, 0);

        let stored = store.inner.find(&EventFilter::All).await.unwrap();
        let mut ids: Vec<_> = stored.iter().map(|e| e.external_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, ["1002", "trn-1001"]);
        assert_eq!(pipeline.state(), PassState::Idle);
    }

    #[tokio::test]
    async fn malformed_page_fails_the_pass() {
        let fetcher = Arc::new(
            FixturePageFetcher::new()
                .with_page(
                    "p1",
                    r#"{"searchHits": [{"metadata": {"id": "a"}, "data": {"ita-IT": {"from_time": "2030-01-01"}}}], "nextPageQuery": "p2"}"#,
                )
                .with_page("p2", r#"{"searchHits": {"oops": true}}"#),
        );
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = SyncPipeline::new("p1", fetcher, store.clone());

        let report = pipeline.run_pass_at(reference()).await;

        assert!(matches!(
            report.outcome,
            PassOutcome::Failed {
                phase: PassState::Paginating,
                kind: FailureKind::MalformedResponse,
                ..
            }
        ));
        assert_eq!(report.upserted, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unreachable_feed_is_a_transient_failure() {
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = SyncPipeline::new("missing", Arc::new(FixturePageFetcher::new()), store);

        let report = pipeline.run_pass_at(reference()).await;

        assert!(matches!(
            report.outcome,
            PassOutcome::Failed {
                kind: FailureKind::TransientFetch,
                ..
            }
        ));
        assert!(report.pages.is_empty());
    }

    #[tokio::test]
    async fn state_returns_to_idle_after_pass() {
        let (manifest, fetcher) = fixture_feed();
        let pipeline = SyncPipeline::new(
            manifest.start_url,
            fetcher,
            Arc::new(MemoryEventStore::new()),
        );
        let mut states = pipeline.subscribe_state();
        assert_eq!(pipeline.state(), PassState::Idle);

        pipeline.run_pass_at(reference()).await;

        assert_eq!(pipeline.state(), PassState::Idle);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), PassState::Idle);
    }

    #[test]
    fn report_serializes_skip_reasons_as_keys() {
        let mut report = PassReport::new(Uuid::nil(), PassMode::Incremental, reference());
        report.skipped.insert(SkipReason::PastEvent, 2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["skipped"]["past_event"], 2);
        assert_eq!(json["outcome"]["status"], "completed");
    }

    #[test]
    fn adapter_errors_map_to_failure_kinds() {
        let unavailable = AdapterError::Fetch(FetchError::HttpStatus {
            status: 503,
            url: "https://feed.test/search".into(),
        });
        assert_eq!(PassError::from(unavailable).kind(), FailureKind::TransientFetch);

        let missing = AdapterError::UnknownFixture("page-9".into());
        assert_eq!(PassError::from(missing).kind(), FailureKind::TransientFetch);

        let garbled = AdapterError::Malformed {
            url: "https://feed.test/search".into(),
            reason: "expected value at line 1".into(),
        };
        assert_eq!(PassError::from(garbled).kind(), FailureKind::MalformedResponse);
    }
}
