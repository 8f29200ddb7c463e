//! Read-only JSON query surface over the event store.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tevents_storage::{EventFilter, EventStore, StoreError};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "tevents-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct IdsQuery {
    #[serde(default)]
    ids: String,
}

impl IdsQuery {
    fn external_ids(&self) -> Vec<String> {
        self.ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/events", get(list_events_handler))
        .route("/api/events/by-ids", get(events_by_ids_handler))
        .with_state(Arc::new(state))
}

/// Serves the API on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read API listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_events_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.find(&EventFilter::All).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

async fn events_by_ids_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IdsQuery>,
) -> Response {
    let ids = query.external_ids();
    if ids.is_empty() {
        return Json(Vec::<tevents_core::CanonicalEvent>::new()).into_response();
    }
    match state.store.find(&EventFilter::ExternalIds(ids)).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "event query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Failed to fetch events" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use tevents_core::{CanonicalEvent, Category, GeoPoint};
    use tevents_storage::MemoryEventStore;
    use tower::ServiceExt;

    fn event(external_id: &str, day: u32) -> CanonicalEvent {
        CanonicalEvent {
            external_id: external_id.to_string(),
            title: format!("Event {external_id}"),
            description: "No description available".to_string(),
            start_time: Utc.with_ymd_and_hms(2030, 5, day, 18, 0, 0).unwrap(),
            location: GeoPoint { lat: 46.07, lng: 11.12 },
            venue_name: "Piazza Duomo".to_string(),
            category: if day % 2 == 0 { Some(Category::Music) } else { None },
            original_type: "Musica".to_string(),
        }
    }

    async fn seeded_app() -> Router {
        let store = Arc::new(MemoryEventStore::new());
        for (id, day) in [("c", 3), ("a", 1), ("b", 2)] {
            store.upsert(&event(id, day)).await.unwrap();
        }
        app(AppState::new(store))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    struct DownStore;

    #[async_trait]
    impl EventStore for DownStore {
        async fn find(&self, _: &EventFilter) -> Result<Vec<CanonicalEvent>, StoreError> {
            Err(StoreError::Unavailable("pool timed out".to_string()))
        }
        async fn upsert(&self, _: &CanonicalEvent) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("pool timed out".to_string()))
        }
        async fn delete_many(&self, _: &EventFilter) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("pool timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn lists_events_by_start_time() {
        let (status, body) = get_json(seeded_app().await, "/api/events").await;
        assert_eq!(status, StatusCode::OK);

        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["external_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(body[1]["category"], "music");
        assert_eq!(body[0]["category"], "");
        assert_eq!(body[0]["location"]["lat"], 46.07);
    }

    #[tokio::test]
    async fn filters_by_id_list() {
        let (status, body) = get_json(seeded_app().await, "/api/events/by-ids?ids=c,%20a,,zzz").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["external_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn empty_id_list_returns_nothing() {
        let (status, body) = get_json(seeded_app().await, "/api/events/by-ids").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn store_failure_maps_to_500() {
        let app = app(AppState::new(Arc::new(DownStore)));
        let (status, body) = get_json(app, "/api/events").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch events");
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (status, body) = get_json(seeded_app().await, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
