//! Event-sourcing runtime over a relational append-only log.
//!
//! `sequent` persists domain state as an immutable event log, rebuilds
//! aggregates by replaying their events, executes commands against that
//! log with strict per-aggregate ordering, and drives downstream
//! projectors and sagas from the same log either synchronously (inside
//! the sink transaction) or asynchronously (bookmark-driven polling).
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventStore`] | Transactional append + ordered, filterable scan |
//! | [`EventSchema`] | Event-class registry: validation, upcasts, metadata overrides |
//! | [`AggregateDefinition`] | The four-function algebra of one aggregate type |
//! | [`CommandGateway`] | Routes commands, rehydrates, sinks, retries conflicts |
//! | [`EventProcessor`] | Ordered fan-out of events to handlers |
//! | [`BatchedEventProcessor`] | Named polling consumer with bookmark progress |
//! | [`PollingSupervisor`] | One worker per consumer, backoff, cooperative stop |
//! | [`ProcessorMonitor`] | Reports per-consumer lag against the log head |
//!
//! Two store dialects exist: [`PostgresEventStore`] for production and
//! [`InMemoryEventStore`] for tests and local development. Nothing else
//! is supported.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sequent::{
//!     AggregateDefinition, CommandGateway, DomainCommand, DomainError, EmptyMetadata,
//!     EventSchema, InMemoryEventStore, MetadataClass,
//! };
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! // 1. Commands, each addressed to one aggregate.
//! #[derive(Debug)]
//! struct OpenCounter { counter_id: Uuid }
//! impl DomainCommand for OpenCounter {
//!     fn aggregate_id(&self) -> Uuid { self.counter_id }
//! }
//!
//! #[derive(Debug)]
//! struct Increment { counter_id: Uuid }
//! impl DomainCommand for Increment {
//!     fn aggregate_id(&self) -> Uuid { self.counter_id }
//! }
//!
//! // 2. Creation and update event unions, adjacently tagged.
//! #[derive(Debug, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterOpened { Opened }
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! #[serde(tag = "type", content = "data")]
//! enum CounterChanged { Incremented }
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("counter rejected the command")]
//! struct CounterRejected;
//! impl DomainError for CounterRejected {}
//!
//! struct Counter { count: u64 }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // 3. Declare the event classes and open a store.
//! let schema = EventSchema::builder()
//!     .events::<CounterOpened>(&["Opened"])
//!     .events::<CounterChanged>(&["Incremented"])
//!     .build();
//! let store = InMemoryEventStore::builder(schema)
//!     .default_metadata(MetadataClass::of::<EmptyMetadata>())
//!     .build();
//!
//! // 4. Bind the aggregate's four functions and register it.
//! let counter = AggregateDefinition::new(
//!     "counter",
//!     |_cmd: &OpenCounter| Ok::<_, CounterRejected>(CounterOpened::Opened),
//!     |_event| Counter { count: 0 },
//!     |_state, _cmd: &Increment| Ok(vec![CounterChanged::Incremented]),
//!     |mut state, _event| { state.count += 1; state },
//! );
//! let gateway: CommandGateway<EmptyMetadata> =
//!     CommandGateway::new(Arc::new(store)).register(counter);
//!
//! // 5. Dispatch commands; events land on the log atomically.
//! let counter_id = Uuid::new_v4();
//! gateway.dispatch(OpenCounter { counter_id }, EmptyMetadata {}).await?;
//! gateway.dispatch(Increment { counter_id }, EmptyMetadata {}).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Downstream, register an [`EventHandler`] on an [`EventProcessor`] and
//! run it behind a [`BatchedEventProcessor`] for at-least-once delivery
//! with bookmark progress, or attach it as a synchronous processor on the
//! store builder to observe events inside the sink transaction.

pub mod aggregate;
pub mod bookmark;
pub mod error;
pub mod event;
pub mod gateway;
pub mod memory;
pub mod metadata;
pub mod poller;
pub mod postgres;
pub mod processor;
pub mod schema;
pub mod stats;
pub mod store;

pub use aggregate::{AggregateDefinition, DomainCommand};
pub use bookmark::{Bookmark, BookmarkStore};
pub use error::{
    CommandError, DomainError, EventDataError, HandlerError, LockError, SinkError, StoreError,
};
pub use event::{Event, SequencedEvent};
pub use gateway::CommandGateway;
pub use memory::{InMemoryBookmarkStore, InMemoryEventStore, InMemorySequenceStats};
pub use metadata::{EmptyMetadata, Metadata, MetadataClass, StandardMetadata};
pub use poller::{
    BatchOutcome, BatchedEventProcessor, DeliveryStats, PollingSupervisor, ProcessingError,
    ProcessorLag, ProcessorMonitor, DEFAULT_BATCH_SIZE,
};
pub use postgres::{
    AdvisoryLock, NoLock, PostgresBookmarkStore, PostgresEventStore, PostgresSequenceStats,
    SinkLock,
};
pub use processor::{EventHandler, EventProcessor, SyncHandler};
pub use schema::{EventSchema, EventSchemaBuilder};
pub use stats::SequenceStats;
pub use store::{EventSource, EventStore};
