//! Store trait seams: the ordered, filterable log surface consumers poll
//! (`EventSource`) and the full append/replay surface the gateway writes
//! through (`EventStore`).
//!
//! Two implementations exist: [`PostgresEventStore`](crate::postgres::PostgresEventStore)
//! for production and [`InMemoryEventStore`](crate::memory::InMemoryEventStore)
//! for tests and local development. There is deliberately no generic SQL
//! path; any other backend is unsupported.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{SinkError, StoreError};
use crate::event::{Event, SequencedEvent};

/// Read-only, globally ordered view of the log.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events with global sequence strictly greater than `sequence`,
    /// ascending, at most `batch_size` of them.
    ///
    /// `event_types` filters by event class tag; an empty slice means no
    /// filter. Interest sets are expanded with superseded tags that
    /// upcast into them, so migrated history is not skipped.
    async fn get_after(
        &self,
        sequence: i64,
        event_types: &[&str],
        batch_size: usize,
    ) -> Result<Vec<SequencedEvent>, StoreError>;

    /// The maximum global sequence, optionally filtered by event class.
    /// Zero when no matching event exists.
    async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError>;
}

/// The full log surface: transactional append plus per-aggregate replay.
#[async_trait]
pub trait EventStore: EventSource {
    /// Append a batch of events atomically.
    ///
    /// Inside one transaction: run the configured blocking-lock hook,
    /// validate and insert each event in order, bump the per-class
    /// sequence stats, and deliver every new event to the synchronous
    /// processors. Any failure rolls the whole batch back.
    ///
    /// # Errors
    ///
    /// [`SinkError::Concurrency`] when another writer already holds one of
    /// the `(aggregate_id, aggregate_sequence)` slots; the caller may
    /// reload and retry. [`SinkError::Locking`] when the lock hook fails;
    /// [`SinkError::Data`] when validation rejects a body or metadata
    /// record; [`SinkError::Processor`] when a synchronous processor
    /// fails. None of those are retriable.
    async fn sink(&self, events: Vec<Event>) -> Result<(), SinkError>;

    /// All events of one aggregate, ascending by aggregate sequence.
    /// Empty when the aggregate does not exist.
    async fn events_for(&self, aggregate_id: Uuid) -> Result<Vec<Event>, StoreError>;
}
