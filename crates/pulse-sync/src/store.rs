//! Shared event store: upsert-only from the pipeline's point of view.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pulse_core::CanonicalEvent;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store unreachable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct UpsertError {
    pub event_hash: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertResult {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<UpsertError>,
}

/// The only operation the pipeline needs from the store. Upserts are keyed
/// by `event_hash`, so replaying a batch is idempotent.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert_batch(&self, events: &[CanonicalEvent]) -> Result<UpsertResult, StoreError>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_hash        TEXT PRIMARY KEY,
    title             TEXT NOT NULL,
    event_date        DATE NOT NULL,
    start_time        TEXT NOT NULL,
    location          TEXT NOT NULL,
    link              TEXT NOT NULL UNIQUE,
    description       TEXT,
    image_url         TEXT,
    source            TEXT NOT NULL,
    price_cents       BIGINT,
    price_tier        TEXT NOT NULL,
    category          TEXT NOT NULL,
    alternate_sources JSONB NOT NULL DEFAULT '[]',
    scraped_at        TIMESTAMPTZ NOT NULL,
    first_synced_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_synced_at    TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO events (
    event_hash, title, event_date, start_time, location, link, description,
    image_url, source, price_cents, price_tier, category, alternate_sources,
    scraped_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT (event_hash) DO UPDATE SET
    title = EXCLUDED.title,
    start_time = EXCLUDED.start_time,
    location = EXCLUDED.location,
    link = EXCLUDED.link,
    description = EXCLUDED.description,
    image_url = EXCLUDED.image_url,
    price_cents = EXCLUDED.price_cents,
    price_tier = EXCLUDED.price_tier,
    category = EXCLUDED.category,
    alternate_sources = EXCLUDED.alternate_sources,
    scraped_at = EXCLUDED.scraped_at,
    last_synced_at = now()
"#;

/// Postgres-backed store shared with the web application and digest.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn upsert_batch(&self, events: &[CanonicalEvent]) -> Result<UpsertResult, StoreError> {
        // a failed acquisition means the store is down; the whole batch is
        // the caller's to retry
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut result = UpsertResult::default();
        for event in events {
            let alternates = serde_json::to_value(&event.alternate_sources)
                .unwrap_or(JsonValue::Array(Vec::new()));
            let outcome = sqlx::query(UPSERT_SQL)
                .bind(&event.event_hash)
                .bind(&event.title)
                .bind(event.date)
                .bind(&event.time)
                .bind(&event.location)
                .bind(&event.link)
                .bind(event.description.as_deref())
                .bind(event.image_url.as_deref())
                .bind(event.source.as_str())
                .bind(event.price_cents.map(i64::from))
                .bind(event.price_tier.as_str())
                .bind(event.category.as_str())
                .bind(alternates)
                .bind(event.scraped_at)
                .execute(&mut *conn)
                .await;

            match outcome {
                Ok(_) => result.succeeded += 1,
                Err(err) => {
                    result.failed += 1;
                    result.errors.push(UpsertError {
                        event_hash: event.event_hash.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }
}

/// Hash-keyed in-memory store. Used by the test suite and by keyless local
/// runs; supports injecting store-unreachable failures.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<String, CanonicalEvent>>,
    failures_remaining: Mutex<u32>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose next `times` upsert calls fail as unreachable.
    pub fn failing(times: u32) -> Self {
        let store = Self::default();
        *store.failures_remaining.lock().expect("store mutex poisoned") = times;
        store
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, event_hash: &str) -> Option<CanonicalEvent> {
        self.events
            .lock()
            .expect("store mutex poisoned")
            .get(event_hash)
            .cloned()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_batch(&self, events: &[CanonicalEvent]) -> Result<UpsertResult, StoreError> {
        {
            let mut failures = self.failures_remaining.lock().expect("store mutex poisoned");
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Unavailable("injected failure".to_string()));
            }
        }

        let mut map = self.events.lock().expect("store mutex poisoned");
        for event in events {
            map.insert(event.event_hash.clone(), event.clone());
        }
        Ok(UpsertResult {
            succeeded: events.len(),
            failed: 0,
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use pulse_core::{event_hash, Category, PriceTier, Source, TIME_TBA};

    fn ev(title: &str) -> CanonicalEvent {
        let date = NaiveDate::from_ymd_opt(2026, 2, 15).expect("date");
        CanonicalEvent {
            title: title.to_string(),
            date,
            time: TIME_TBA.to_string(),
            location: "Forum".to_string(),
            link: format!("https://example.com/e/{title}"),
            description: None,
            image_url: None,
            source: Source::Eventbrite,
            price_cents: None,
            price_tier: PriceTier::Free,
            category: Category::Untagged,
            event_hash: event_hash(title, date, "Forum", Source::Eventbrite),
            alternate_sources: Vec::new(),
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_upserts_are_idempotent_by_hash() {
        let store = MemoryEventStore::new();
        let batch = vec![ev("one"), ev("two")];

        let first = store.upsert_batch(&batch).await.expect("first");
        assert_eq!(first.succeeded, 2);
        let second = store.upsert_batch(&batch).await.expect("second");
        assert_eq!(second.succeeded, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let store = MemoryEventStore::failing(1);
        let batch = vec![ev("one")];

        assert!(matches!(
            store.upsert_batch(&batch).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.upsert_batch(&batch).await.is_ok());
        assert_eq!(store.len(), 1);
    }
}
