//! PostgreSQL dialect: the production event store, bookmark store, and
//! sequence stats, plus the advisory-lock sink strategy.
//!
//! All dialect coupling lives in this module. The schema uses JSONB
//! bodies and a `BIGSERIAL` global sequence, so sequence order matches
//! commit order of successful sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::bookmark::{Bookmark, BookmarkStore};
use crate::error::{LockError, SinkError, StoreError};
use crate::event::{Event, SequencedEvent};
use crate::metadata::{MetadataClass, StandardMetadata};
use crate::processor::EventProcessor;
use crate::schema::EventSchema;
use crate::stats::SequenceStats;
use crate::store::{EventSource, EventStore};

/// DDL for the events table.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events (
    sequence            BIGSERIAL PRIMARY KEY,
    id                  UUID UNIQUE NOT NULL,
    aggregate_sequence  BIGINT NOT NULL,
    aggregate_id        UUID NOT NULL,
    aggregate_type      VARCHAR(128) NOT NULL,
    event_type          VARCHAR(256) NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    json_body           JSONB NOT NULL,
    metadata            JSONB NOT NULL,
    UNIQUE (aggregate_id, aggregate_sequence)
);

CREATE INDEX IF NOT EXISTS idx_events_event_type_aggregate_type
    ON events (event_type, aggregate_type);
";

/// DDL for the bookmarks table.
pub const CREATE_BOOKMARKS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS bookmarks (
    name        VARCHAR(160) PRIMARY KEY,
    value       BIGINT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

/// DDL for the per-event-class high-water-mark table.
pub const CREATE_SEQUENCE_STATS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS events_sequence_stats (
    event_type  VARCHAR(256) PRIMARY KEY,
    sequence    BIGINT NOT NULL
);
";

const INSERT_EVENT: &str = r"
INSERT INTO events
    (id, aggregate_sequence, aggregate_id, aggregate_type, event_type, created_at, json_body, metadata)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING sequence
";

const UPSERT_STATS: &str = r"
INSERT INTO events_sequence_stats (event_type, sequence)
VALUES ($1, $2)
ON CONFLICT (event_type)
DO UPDATE SET sequence = GREATEST(events_sequence_stats.sequence, EXCLUDED.sequence)
";

const EVENT_COLUMNS: &str =
    "sequence, id, aggregate_sequence, aggregate_id, aggregate_type, event_type, created_at, json_body, metadata";

/// Postgres sqlstate for a unique-constraint violation.
const UNIQUE_VIOLATION: &str = "23505";
/// Postgres sqlstate raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Strategy run at the top of every sink transaction.
///
/// The default, [`NoLock`], does nothing; concurrent writers are then
/// serialized per aggregate by the unique constraint alone.
#[async_trait]
pub trait SinkLock: Send + Sync {
    /// Acquire whatever lock the strategy calls for, inside `tx`.
    async fn acquire(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), LockError>;
}

/// The no-op lock strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

#[async_trait]
impl SinkLock for NoLock {
    async fn acquire(&self, _tx: &mut Transaction<'_, Postgres>) -> Result<(), LockError> {
        Ok(())
    }
}

/// Transaction-scoped advisory lock serializing all sinks on one key.
///
/// Coarse by design: useful for deterministic tests and migration
/// windows, not for steady-state throughput. The wait is bounded by a
/// session-local `lock_timeout`; hitting it surfaces as
/// [`LockError::Timeout`] and the sink is aborted without retry.
#[derive(Debug, Clone, Copy)]
pub struct AdvisoryLock {
    key: i64,
    timeout: Duration,
}

impl AdvisoryLock {
    /// Lock on `key` with the default 10 second wait bound.
    pub fn new(key: i64) -> Self {
        Self {
            key,
            timeout: Duration::from_secs(10),
        }
    }

    /// Override the wait bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The advisory lock key.
    pub fn key(&self) -> i64 {
        self.key
    }

    /// The configured wait bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl SinkLock for AdvisoryLock {
    async fn acquire(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), LockError> {
        // lock_timeout does not accept bind parameters; the value is a
        // formatted integer, not caller input.
        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.timeout.as_millis());
        sqlx::query(&set_timeout)
            .execute(&mut **tx)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        match sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.key)
            .execute(&mut **tx)
            .await
        {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                Err(LockError::Timeout(self.timeout))
            }
            Err(e) => Err(LockError::Backend(e.to_string())),
        }
    }
}

/// PostgreSQL-backed [`EventStore`].
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    schema: Arc<EventSchema>,
    default_metadata: MetadataClass,
    lock: Arc<dyn SinkLock>,
    processors: Vec<Arc<EventProcessor>>,
}

impl PostgresEventStore {
    /// Start configuring a store over `pool` and `schema`.
    pub fn builder(pool: PgPool, schema: EventSchema) -> PostgresStoreBuilder {
        PostgresStoreBuilder {
            pool,
            schema,
            default_metadata: MetadataClass::of::<StandardMetadata>(),
            lock: Arc::new(NoLock),
            processors: Vec::new(),
        }
    }

    /// Create the events, bookmarks, and sequence-stats tables if absent.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        for ddl in [
            CREATE_EVENTS_TABLE,
            CREATE_BOOKMARKS_TABLE,
            CREATE_SEQUENCE_STATS_TABLE,
        ] {
            sqlx::raw_sql(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn upcasted(&self, mut sequenced: SequencedEvent) -> SequencedEvent {
        let (event_type, body) = self.schema.apply_upcasts(
            std::mem::take(&mut sequenced.event.event_type),
            std::mem::take(&mut sequenced.event.body),
        );
        sequenced.event.event_type = event_type;
        sequenced.event.body = body;
        sequenced
    }
}

impl std::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventStore")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Builder for [`PostgresEventStore`].
pub struct PostgresStoreBuilder {
    pool: PgPool,
    schema: EventSchema,
    default_metadata: MetadataClass,
    lock: Arc<dyn SinkLock>,
    processors: Vec<Arc<EventProcessor>>,
}

impl PostgresStoreBuilder {
    /// Metadata class every event is validated against unless its tag
    /// registered a narrower one. Defaults to
    /// [`StandardMetadata`](crate::metadata::StandardMetadata).
    pub fn default_metadata(mut self, class: MetadataClass) -> Self {
        self.default_metadata = class;
        self
    }

    /// Replace the blocking-lock strategy. Defaults to [`NoLock`].
    pub fn sink_lock(mut self, lock: impl SinkLock + 'static) -> Self {
        self.lock = Arc::new(lock);
        self
    }

    /// Add a processor that runs inside every sink transaction, in
    /// registration order, before commit. A failure rolls the sink back.
    ///
    /// Synchronous processors must not sink further events into the same
    /// store; follow-up commands belong on the asynchronous path.
    pub fn synchronous_processor(mut self, processor: EventProcessor) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Finish configuration.
    pub fn build(self) -> PostgresEventStore {
        PostgresEventStore {
            pool: self.pool,
            schema: Arc::new(self.schema),
            default_metadata: self.default_metadata,
            lock: self.lock,
            processors: self.processors,
        }
    }
}

fn map_insert_error(err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            SinkError::Concurrency
        }
        other => SinkError::Store(StoreError::Database(other)),
    }
}

fn row_to_sequenced(row: &PgRow) -> Result<SequencedEvent, sqlx::Error> {
    Ok(SequencedEvent {
        sequence: row.try_get("sequence")?,
        event: Event {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_sequence: row.try_get("aggregate_sequence")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            created_at: row.try_get("created_at")?,
            body: row.try_get("json_body")?,
            metadata: row.try_get("metadata")?,
        },
    })
}

#[async_trait]
impl EventSource for PostgresEventStore {
    async fn get_after(
        &self,
        sequence: i64,
        event_types: &[&str],
        batch_size: usize,
    ) -> Result<Vec<SequencedEvent>, StoreError> {
        let interests = self.schema.expand_interests(event_types);
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let rows = if interests.is_empty() {
            sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE sequence > $1 ORDER BY sequence ASC LIMIT $2"
            ))
            .bind(sequence)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE sequence > $1 AND event_type = ANY($2) ORDER BY sequence ASC LIMIT $3"
            ))
            .bind(sequence)
            .bind(&interests)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter()
            .map(|row| Ok(self.upcasted(row_to_sequenced(row)?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError> {
        let interests = self.schema.expand_interests(event_types);
        let row = if interests.is_empty() {
            sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS last FROM events")
                .fetch_one(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT COALESCE(MAX(sequence), 0) AS last FROM events WHERE event_type = ANY($1)",
            )
            .bind(&interests)
            .fetch_one(&self.pool)
            .await?
        };
        row.try_get("last").map_err(StoreError::from)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn sink(&self, events: Vec<Event>) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;
        self.lock.acquire(&mut tx).await.map_err(SinkError::Locking)?;

        let mut staged = Vec::with_capacity(events.len());
        for event in events {
            self.schema
                .validate(&event, &self.default_metadata)
                .map_err(SinkError::Data)?;

            let row = sqlx::query(INSERT_EVENT)
                .bind(event.id)
                .bind(event.aggregate_sequence)
                .bind(event.aggregate_id)
                .bind(&event.aggregate_type)
                .bind(&event.event_type)
                .bind(event.created_at)
                .bind(&event.body)
                .bind(&event.metadata)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_insert_error)?;
            let sequence: i64 = row.try_get("sequence").map_err(StoreError::from)?;

            sqlx::query(UPSERT_STATS)
                .bind(&event.event_type)
                .bind(sequence)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;

            staged.push(SequencedEvent { sequence, event });
        }

        // Dropping the transaction on any processor error rolls the
        // whole batch back.
        for sequenced in &staged {
            let view = self.upcasted(sequenced.clone());
            for processor in &self.processors {
                processor
                    .process(&view)
                    .await
                    .map_err(SinkError::Processor)?;
            }
        }

        tx.commit().await.map_err(StoreError::from)?;

        tracing::debug!(
            aggregate_id = %staged[0].event.aggregate_id,
            events = staged.len(),
            last_sequence = staged[staged.len() - 1].sequence,
            "sunk event batch"
        );
        Ok(())
    }

    async fn events_for(&self, aggregate_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 ORDER BY aggregate_sequence ASC"
        ))
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(self.upcasted(row_to_sequenced(row)?).event))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}

/// PostgreSQL-backed [`BookmarkStore`].
#[derive(Debug, Clone)]
pub struct PostgresBookmarkStore {
    pool: PgPool,
}

impl PostgresBookmarkStore {
    /// A bookmark store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookmarkStore for PostgresBookmarkStore {
    async fn bookmark_for(&self, name: &str) -> Result<Bookmark, StoreError> {
        let row = sqlx::query("SELECT value FROM bookmarks WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let sequence = match row {
            Some(row) => row.try_get("value")?,
            None => 0,
        };
        Ok(Bookmark::at(sequence))
    }

    async fn save(&self, name: &str, bookmark: Bookmark) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO bookmarks (name, value, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (name)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            ",
        )
        .bind(name)
        .bind(bookmark.sequence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// PostgreSQL-backed [`SequenceStats`], reading the table the event store
/// upserts inside each sink transaction.
#[derive(Debug, Clone)]
pub struct PostgresSequenceStats {
    pool: PgPool,
    schema: Arc<EventSchema>,
}

impl PostgresSequenceStats {
    /// A stats reader over `pool`, expanding interests through `schema`.
    pub fn new(pool: PgPool, schema: Arc<EventSchema>) -> Self {
        Self { pool, schema }
    }
}

#[async_trait]
impl SequenceStats for PostgresSequenceStats {
    async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError> {
        let interests = self.schema.expand_interests(event_types);
        let row = if interests.is_empty() {
            sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS last FROM events_sequence_stats")
                .fetch_one(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT COALESCE(MAX(sequence), 0) AS last FROM events_sequence_stats WHERE event_type = ANY($1)",
            )
            .bind(&interests)
            .fetch_one(&self.pool)
            .await?
        };
        row.try_get("last").map_err(StoreError::from)
    }
}
