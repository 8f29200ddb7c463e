use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tevents_core::{CanonicalEvent, Category, GeoPoint};
use tracing::info;

use crate::events::{EventFilter, EventStore, StoreError};

const SELECT_COLUMNS: &str = r#"
    SELECT external_id, title, description, start_time, latitude, longitude,
           venue_name, category, original_type
      FROM events
"#;

const ORDER_BY: &str = " ORDER BY start_time, external_id";

/// Postgres-backed event store over the `events` table.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("event store migrations applied");
        Ok(())
    }
}

fn row_to_event(row: &PgRow) -> Result<CanonicalEvent, StoreError> {
    let external_id: String = row.try_get("external_id")?;
    let category: String = row.try_get("category")?;
    let category = if category.is_empty() {
        None
    } else {
        let parsed = category
            .parse::<Category>()
            .map_err(|e| StoreError::InvalidRow {
                external_id: external_id.clone(),
                reason: e.to_string(),
            })?;
        Some(parsed)
    };
    let start_time: DateTime<Utc> = row.try_get("start_time")?;

    Ok(CanonicalEvent {
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start_time,
        location: GeoPoint {
            lat: row.try_get("latitude")?,
            lng: row.try_get("longitude")?,
        },
        venue_name: row.try_get("venue_name")?,
        category,
        original_type: row.try_get("original_type")?,
        external_id,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn find(&self, filter: &EventFilter) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = match filter {
            EventFilter::All => {
                sqlx::query(&format!("{SELECT_COLUMNS}{ORDER_BY}"))
                    .fetch_all(&self.pool)
                    .await?
            }
            EventFilter::StartsBefore(reference) => {
                sqlx::query(&format!("{SELECT_COLUMNS} WHERE start_time < $1{ORDER_BY}"))
                    .bind(*reference)
                    .fetch_all(&self.pool)
                    .await?
            }
            EventFilter::ExternalIds(ids) => {
                sqlx::query(&format!(
                    "{SELECT_COLUMNS} WHERE external_id = ANY($1){ORDER_BY}"
                ))
                .bind(ids.as_slice())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_event).collect()
    }

    async fn upsert(&self, event: &CanonicalEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events (
                external_id, title, description, start_time, latitude, longitude,
                venue_name, category, original_type, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (external_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                start_time = EXCLUDED.start_time,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                venue_name = EXCLUDED.venue_name,
                category = EXCLUDED.category,
                original_type = EXCLUDED.original_type,
                updated_at = NOW()
            "#,
        )
        .bind(&event.external_id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_time)
        .bind(event.location.lat)
        .bind(event.location.lng)
        .bind(&event.venue_name)
        .bind(event.category_str())
        .bind(&event.original_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_many(&self, filter: &EventFilter) -> Result<u64, StoreError> {
        let result = match filter {
            EventFilter::All => sqlx::query("DELETE FROM events").execute(&self.pool).await?,
            EventFilter::StartsBefore(reference) => {
                sqlx::query("DELETE FROM events WHERE start_time < $1")
                    .bind(*reference)
                    .execute(&self.pool)
                    .await?
            }
            EventFilter::ExternalIds(ids) => {
                sqlx::query("DELETE FROM events WHERE external_id = ANY($1)")
                    .bind(ids.as_slice())
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}
