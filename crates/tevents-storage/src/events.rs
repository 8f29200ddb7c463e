use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tevents_core::CanonicalEvent;
use thiserror::Error;
use tokio::sync::RwLock;

/// Row selection shared by `find` and `delete_many`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// Events whose start time is strictly before the given instant.
    StartsBefore(DateTime<Utc>),
    ExternalIds(Vec<String>),
}

impl EventFilter {
    pub fn matches(&self, event: &CanonicalEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::StartsBefore(reference) => event.is_stale_at(*reference),
            EventFilter::ExternalIds(ids) => ids.iter().any(|id| id == &event.external_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored row {external_id}: {reason}")]
    InvalidRow { external_id: String, reason: String },
    #[error("{0}")]
    Unavailable(String),
}

/// Read/write event store keyed by `CanonicalEvent::external_id`.
///
/// `find` returns events ordered by start time, then external id.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find(&self, filter: &EventFilter) -> Result<Vec<CanonicalEvent>, StoreError>;

    /// Create the event if its external id is unknown, otherwise replace every field.
    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), StoreError>;

    /// Returns the number of removed events.
    async fn delete_many(&self, filter: &EventFilter) -> Result<u64, StoreError>;
}

/// Process-local store used by tests and the `memory` backend.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<BTreeMap<String, CanonicalEvent>>,
    mutations: AtomicU64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Upserts performed plus rows deleted since construction.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find(&self, filter: &EventFilter) -> Result<Vec<CanonicalEvent>, StoreError> {
        let events = self.events.read().await;
        let mut out = match filter {
            EventFilter::ExternalIds(ids) => {
                let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                wanted
                    .into_iter()
                    .filter_map(|id| events.get(id).cloned())
                    .collect::<Vec<_>>()
            }
            _ => events
                .values()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect::<Vec<_>>(),
        };
        out.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });
        Ok(out)
    }

    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .await
            .insert(event.external_id.clone(), event.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_many(&self, filter: &EventFilter) -> Result<u64, StoreError> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|_, e| !filter.matches(e));
        let removed = (before - events.len()) as u64;
        self.mutations.fetch_add(removed, Ordering::SeqCst);
        Ok(removed)
    }
}
