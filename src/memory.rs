//! In-memory store implementations: the testing dialect.
//!
//! Mirrors the relational semantics without a database: dense global
//! sequences, `(aggregate_id, aggregate_sequence)` conflict detection,
//! pre-commit validation, in-transaction synchronous processors, and
//! per-class sequence stats. Sinks stage their rows and commit only
//! after every synchronous processor accepted them, all under one async
//! lock, so concurrent writers serialize the same way they would against
//! the unique constraint.
//!
//! The blocking-lock hook of the relational dialect is a no-op here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bookmark::{Bookmark, BookmarkStore};
use crate::error::{SinkError, StoreError};
use crate::event::{Event, SequencedEvent};
use crate::metadata::{MetadataClass, StandardMetadata};
use crate::processor::EventProcessor;
use crate::schema::EventSchema;
use crate::stats::SequenceStats;
use crate::store::{EventSource, EventStore};

#[derive(Default)]
struct Inner {
    /// Committed rows, ascending by global sequence, stored pre-upcast.
    rows: Vec<SequencedEvent>,
    event_ids: HashSet<Uuid>,
    slots: HashSet<(Uuid, i64)>,
    stats: HashMap<String, i64>,
    last_sequence: i64,
}

/// In-memory [`EventStore`]. Cloning shares the underlying log.
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
    schema: Arc<EventSchema>,
    default_metadata: MetadataClass,
    processors: Vec<Arc<EventProcessor>>,
}

impl InMemoryEventStore {
    /// Start configuring a store over `schema`.
    pub fn builder(schema: EventSchema) -> InMemoryStoreBuilder {
        InMemoryStoreBuilder {
            schema,
            default_metadata: MetadataClass::of::<StandardMetadata>(),
            processors: Vec::new(),
        }
    }

    /// Handle onto this store's per-class sequence stats.
    pub fn sequence_stats(&self) -> InMemorySequenceStats {
        InMemorySequenceStats {
            inner: self.inner.clone(),
            schema: self.schema.clone(),
        }
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

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Builder for [`InMemoryEventStore`].
pub struct InMemoryStoreBuilder {
    schema: EventSchema,
    default_metadata: MetadataClass,
    processors: Vec<Arc<EventProcessor>>,
}

impl InMemoryStoreBuilder {
    /// Metadata class every event is validated against unless its tag
    /// registered a narrower one. Defaults to
    /// [`StandardMetadata`](crate::metadata::StandardMetadata).
    pub fn default_metadata(mut self, class: MetadataClass) -> Self {
        self.default_metadata = class;
        self
    }

    /// Add a processor that runs inside every sink, in registration
    /// order, before the batch commits. A failure aborts the sink.
    ///
    /// Synchronous processors must not sink further events into the same
    /// store; follow-up commands belong on the asynchronous path.
    pub fn synchronous_processor(mut self, processor: EventProcessor) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Finish configuration.
    pub fn build(self) -> InMemoryEventStore {
        InMemoryEventStore {
            inner: Arc::new(Mutex::new(Inner::default())),
            schema: Arc::new(self.schema),
            default_metadata: self.default_metadata,
            processors: self.processors,
        }
    }
}

#[async_trait]
impl EventSource for InMemoryEventStore {
    async fn get_after(
        &self,
        sequence: i64,
        event_types: &[&str],
        batch_size: usize,
    ) -> Result<Vec<SequencedEvent>, StoreError> {
        let interests = self.schema.expand_interests(event_types);
        let inner = self.inner.lock().await;
        let batch = inner
            .rows
            .iter()
            .filter(|se| se.sequence > sequence)
            .filter(|se| {
                interests.is_empty() || interests.iter().any(|t| t == &se.event.event_type)
            })
            .take(batch_size)
            .cloned()
            .map(|se| self.upcasted(se))
            .collect();
        Ok(batch)
    }

    async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError> {
        let interests = self.schema.expand_interests(event_types);
        let inner = self.inner.lock().await;
        let last = inner
            .rows
            .iter()
            .filter(|se| {
                interests.is_empty() || interests.iter().any(|t| t == &se.event.event_type)
            })
            .map(|se| se.sequence)
            .max()
            .unwrap_or(0);
        Ok(last)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn sink(&self, events: Vec<Event>) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }

        // The lock is held across processor delivery: sinks serialize,
        // and nothing is visible to readers until the batch commits.
        let mut inner = self.inner.lock().await;

        for event in &events {
            self.schema
                .validate(event, &self.default_metadata)
                .map_err(SinkError::Data)?;
            if inner
                .slots
                .contains(&(event.aggregate_id, event.aggregate_sequence))
                || inner.event_ids.contains(&event.id)
            {
                return Err(SinkError::Concurrency);
            }
        }

        let mut staged = Vec::with_capacity(events.len());
        let mut sequence = inner.last_sequence;
        for event in events {
            sequence += 1;
            staged.push(SequencedEvent { sequence, event });
        }

        for sequenced in &staged {
            let view = self.upcasted(sequenced.clone());
            for processor in &self.processors {
                processor
                    .process(&view)
                    .await
                    .map_err(SinkError::Processor)?;
            }
        }

        tracing::debug!(
            aggregate_id = %staged[0].event.aggregate_id,
            events = staged.len(),
            last_sequence = sequence,
            "sunk event batch"
        );

        for sequenced in staged {
            inner
                .event_ids
                .insert(sequenced.event.id);
            inner
                .slots
                .insert((sequenced.event.aggregate_id, sequenced.event.aggregate_sequence));
            let entry = inner
                .stats
                .entry(sequenced.event.event_type.clone())
                .or_insert(0);
            *entry = (*entry).max(sequenced.sequence);
            inner.rows.push(sequenced);
        }
        inner.last_sequence = sequence;

        Ok(())
    }

    async fn events_for(&self, aggregate_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events: Vec<Event> = inner
            .rows
            .iter()
            .filter(|se| se.event.aggregate_id == aggregate_id)
            .cloned()
            .map(|se| self.upcasted(se).event)
            .collect();
        events.sort_by_key(|e| e.aggregate_sequence);
        Ok(events)
    }
}

/// Stats view over an [`InMemoryEventStore`]'s log.
#[derive(Clone)]
pub struct InMemorySequenceStats {
    inner: Arc<Mutex<Inner>>,
    schema: Arc<EventSchema>,
}

#[async_trait]
impl SequenceStats for InMemorySequenceStats {
    async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError> {
        let interests = self.schema.expand_interests(event_types);
        let inner = self.inner.lock().await;
        let last = if interests.is_empty() {
            inner.stats.values().copied().max().unwrap_or(0)
        } else {
            interests
                .iter()
                .filter_map(|t| inner.stats.get(t.as_str()).copied())
                .max()
                .unwrap_or(0)
        };
        Ok(last)
    }
}

/// In-memory [`BookmarkStore`]. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemoryBookmarkStore {
    bookmarks: Arc<Mutex<HashMap<String, i64>>>,
}

impl InMemoryBookmarkStore {
    /// An empty bookmark store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookmarkStore for InMemoryBookmarkStore {
    async fn bookmark_for(&self, name: &str) -> Result<Bookmark, StoreError> {
        let bookmarks = self.bookmarks.lock().await;
        Ok(Bookmark::at(bookmarks.get(name).copied().unwrap_or(0)))
    }

    async fn save(&self, name: &str, bookmark: Bookmark) -> Result<(), StoreError> {
        let mut bookmarks = self.bookmarks.lock().await;
        bookmarks.insert(name.to_string(), bookmark.sequence);
        Ok(())
    }
}
