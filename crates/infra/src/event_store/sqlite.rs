//! SQLite-backed event store.
//!
//! Each event is stored as one JSON document keyed by its event id. The
//! filterable fields are duplicated into indexed columns; the document stays
//! the source of truth and is what queries decode.
//!
//! ## Error Mapping
//!
//! | SQLx error | EventStoreError |
//! |------------|-----------------|
//! | unique violation on `event_id` | `DuplicateEvent` |
//! | any other database / pool / IO error | `Unavailable` |
//! | undecodable document | `Serialization` |
//!
//! `occurred_at` is written as fixed-width RFC 3339 (nanoseconds, `Z`), so
//! text comparison orders timestamps correctly.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, instrument};

use qcflow_events::DomainEvent;

use super::r#trait::{EventFilter, EventStore, EventStoreError};

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        position       INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id       TEXT NOT NULL UNIQUE,
        workspace_id   TEXT NOT NULL,
        aggregate_id   TEXT NOT NULL,
        event_type     TEXT NOT NULL,
        occurred_at    TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        causation_id   TEXT,
        document       TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_workspace ON events (workspace_id, occurred_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_aggregate ON events (aggregate_id, occurred_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type, occurred_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_correlation ON events (correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_causation ON events (causation_id)",
];

/// Durable append-only event store on SQLite.
///
/// Cloning shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    ///
    /// Accepts `sqlite://path/to/file.db` and `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// A single connection that is never recycled: every connection to
    /// `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self, EventStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, EventStoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), EventStoreError> {
        for statement in MIGRATIONS.iter().copied() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    /// Close the pool; pending writes are flushed.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert<'c, E>(executor: E, event: &DomainEvent) -> Result<(), EventStoreError>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let document = serde_json::to_string(event)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO events (
                event_id, workspace_id, aggregate_id, event_type,
                occurred_at, correlation_id, causation_id, document
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id().to_string())
        .bind(event.workspace_id().as_str())
        .bind(event.aggregate_id().as_str())
        .bind(event.event_type())
        .bind(timestamp_key(event.occurred_at()))
        .bind(event.correlation_id().to_string())
        .bind(event.causation_id().map(|id| id.to_string()))
        .bind(document)
        .execute(executor)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::DuplicateEvent(event.event_id())
            } else {
                map_sqlx_error("append", e)
            }
        })?;

        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id(), event_type = %event.event_type()),
        err
    )]
    async fn append(&self, event: DomainEvent) -> Result<(), EventStoreError> {
        Self::insert(&self.pool, &event).await
    }

    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn append_batch(&self, events: Vec<DomainEvent>) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Dropping `tx` on the error path rolls the whole batch back.
        for event in &events {
            Self::insert(&mut *tx, event).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError> {
        filter.validate()?;

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT document FROM events WHERE 1 = 1");

        if let Some(workspace_id) = &filter.workspace_id {
            qb.push(" AND workspace_id = ").push_bind(workspace_id.as_str());
        }
        if let Some(aggregate_id) = &filter.aggregate_id {
            qb.push(" AND aggregate_id = ").push_bind(aggregate_id.as_str());
        }
        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(id) = filter.causality_id {
            let id = id.to_string();
            qb.push(" AND (correlation_id = ")
                .push_bind(id.clone())
                .push(" OR causation_id = ")
                .push_bind(id)
                .push(")");
        }
        if let Some(since) = filter.since {
            qb.push(" AND occurred_at >= ").push_bind(timestamp_key(since));
        }
        if let Some(until) = filter.until {
            qb.push(" AND occurred_at <= ").push_bind(timestamp_key(until));
        }
        qb.push(" ORDER BY occurred_at ASC, position ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let document: String = row
                .try_get("document")
                .map_err(|e| map_sqlx_error("query", e))?;
            let event: DomainEvent = serde_json::from_str(&document)
                .map_err(|e| EventStoreError::Serialization(format!("failed to decode event document: {e}")))?;
            events.push(event);
        }

        debug!(event_count = events.len(), "event query served");
        Ok(events)
    }
}

fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventStoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use chrono::{Duration, TimeZone};
    use qcflow_core::EventId;
    use qcflow_core::{AggregateId, WorkspaceId};
    use serde_json::json;

    fn ws(id: &str) -> WorkspaceId {
        WorkspaceId::new(id).unwrap()
    }

    fn agg(id: &str) -> AggregateId {
        AggregateId::new(id).unwrap()
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn events_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("events.db").display());

        let created = DomainEvent::root(ws("w"), agg("task-1"), "TaskCreated", json!({"title": "Pour slab"}))
            .with_source("site-app");
        let failed = DomainEvent::caused_by(&created, agg("task-1"), "QCFailed", json!({"reason": "crack"}));

        {
            let store = SqliteEventStore::connect(&url).await.unwrap();
            store.append(created.clone()).await.unwrap();
            store.append(failed.clone()).await.unwrap();
            store.close().await;
        }

        let reopened = SqliteEventStore::connect(&url).await.unwrap();
        let events = reopened.events_for_aggregate(&agg("task-1")).await.unwrap();
        assert_eq!(events, vec![created.clone(), failed]);
        assert_eq!(events[0].metadata().source.as_deref(), Some("site-app"));
    }

    #[tokio::test]
    async fn duplicate_id_is_reported_and_batch_rolls_back() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let event = DomainEvent::root(ws("w"), agg("a"), "TaskCreated", json!({}));
        store.append(event.clone()).await.unwrap();

        let err = store.append(event.clone()).await.unwrap_err();
        assert_eq!(err, EventStoreError::DuplicateEvent(event.event_id()));

        let fresh = DomainEvent::root(ws("w"), agg("b"), "TaskCreated", json!({}));
        let err = store.append_batch(vec![fresh, event.clone()]).await.unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateEvent(_)));

        let all = store.events_for_workspace(&ws("w")).await.unwrap();
        assert_eq!(all, vec![event]);
    }

    #[tokio::test]
    async fn filters_match_the_in_memory_semantics() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let root = DomainEvent::root(ws("w"), agg("task-1"), "QCFailed", json!({})).at(base());
        let issue = DomainEvent::caused_by(&root, agg("issue-1"), "IssueCreated", json!({}))
            .at(base() + Duration::seconds(1));
        let other_ws = DomainEvent::root(ws("v"), agg("task-9"), "TaskCreated", json!({}))
            .at(base() + Duration::seconds(2));
        store
            .append_batch(vec![other_ws.clone(), issue.clone(), root.clone()])
            .await
            .unwrap();

        assert_eq!(store.events_for_workspace(&ws("w")).await.unwrap(), vec![root.clone(), issue.clone()]);
        assert_eq!(store.events_by_type("TaskCreated").await.unwrap(), vec![other_ws.clone()]);
        assert_eq!(
            store.events_by_causality(root.event_id()).await.unwrap(),
            vec![root.clone(), issue.clone()]
        );
        assert_eq!(
            store.events_in_range(base() + Duration::seconds(1), base() + Duration::seconds(2)).await.unwrap(),
            vec![issue, other_ws]
        );
        assert!(matches!(
            store.events_in_range(base() + Duration::seconds(2), base()).await,
            Err(EventStoreError::InvalidQuery(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batches_share_one_file_log() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("events.db").display());
        let store = SqliteEventStore::connect(&url).await.unwrap();

        let tasks: Vec<_> = (0..32i64)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let aggregate = agg(&format!("task-{n}"));
                    let at = base() + Duration::seconds(n);
                    let created = DomainEvent::root(ws("w"), aggregate.clone(), "TaskCreated", json!({})).at(at);
                    let assigned = DomainEvent::caused_by(&created, aggregate, "TaskAssigned", json!({}))
                        .at(at + Duration::milliseconds(500));
                    store.append_batch(vec![created, assigned]).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let events = store.events_for_workspace(&ws("w")).await.unwrap();
        assert_eq!(events.len(), 64);
        let ids: HashSet<EventId> = events.iter().map(DomainEvent::event_id).collect();
        assert_eq!(ids.len(), 64);
        assert!(events.windows(2).all(|pair| pair[0].occurred_at() <= pair[1].occurred_at()));
        for pair in events.chunks(2) {
            assert_eq!(pair[1].causation_id(), Some(pair[0].event_id()));
        }
    }
}
