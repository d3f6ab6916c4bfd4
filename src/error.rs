//! Crate-level error types for command dispatch, sinking, and event data.

use std::time::Duration;

use uuid::Uuid;

/// Error returned by a handler while consuming an event.
///
/// Handlers report failures as boxed errors; the runtime only needs to
/// know that the event was not consumed, so the bookmark must not advance.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A command rejection produced by an aggregate's own decision logic.
///
/// Implemented by each aggregate's error type (e.g. "survey name already
/// taken"). Carried behind a trait object through [`CommandError::Domain`]
/// so the gateway stays agnostic of concrete domain error sums.
pub trait DomainError: std::error::Error + Send + Sync + 'static {
    /// True when the command had already been applied and this rejection
    /// is an idempotent no-op rather than a genuine failure. Callers may
    /// treat such rejections as success.
    fn already_actioned(&self) -> bool {
        false
    }
}

/// Event body or metadata failed to round-trip through the serializer.
///
/// These are programming errors in aggregate or metadata wiring, not
/// runtime conditions: the gateway never retries them, and a sink that
/// produces one rolls its transaction back without writing a row.
#[derive(Debug, thiserror::Error)]
pub enum EventDataError {
    /// The event type tag has no registered decoder.
    #[error("unregistered event type: {0}")]
    UnknownType(String),

    /// A produced body does not deserialize back into its declared union.
    #[error("event body for {event_type} does not round-trip: {source}")]
    Body {
        /// Tag of the offending event class.
        event_type: String,
        /// The underlying decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// A produced metadata record does not deserialize as the metadata
    /// class configured for the event (the store default, or a narrower
    /// class registered for the event type).
    #[error("metadata for {event_type} is not a valid {class}: {source}")]
    Metadata {
        /// Tag of the offending event class, or `*` for the dispatch-wide
        /// metadata record.
        event_type: String,
        /// Name of the metadata class the record was checked against.
        class: &'static str,
        /// The underlying decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// A domain value did not serialize as an adjacently tagged object
    /// (`{"type": ..., "data": ...}`), so no event type tag could be
    /// extracted from it.
    #[error("{type_name} does not serialize as an adjacently tagged event")]
    Shape {
        /// Rust type name of the offending value.
        type_name: &'static str,
    },
}

/// Failure acquiring the sink's blocking lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was not granted within the configured bound.
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),

    /// The backend rejected the lock request for another reason.
    #[error("lock acquisition failed: {0}")]
    Backend(String),
}

/// Infrastructure failure talking to a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database connection or query failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be interpreted.
    #[error(transparent)]
    Data(#[from] EventDataError),
}

/// Error returned by [`EventStore::sink`](crate::store::EventStore::sink).
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Another writer inserted the same `(aggregate_id, aggregate_sequence)`
    /// first. Retriable: reload the aggregate and try again.
    #[error("concurrent write conflict on aggregate event sequence")]
    Concurrency,

    /// The blocking-lock hook failed; the sink was aborted. Not retried.
    #[error(transparent)]
    Locking(LockError),

    /// Pre-commit validation rejected an event body or metadata record.
    #[error(transparent)]
    Data(EventDataError),

    /// A synchronous processor failed inside the sink transaction; the
    /// transaction was rolled back.
    #[error("synchronous event processor failed: {0}")]
    Processor(HandlerError),

    /// Infrastructure failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error surfaced to a [`CommandGateway`](crate::gateway::CommandGateway)
/// caller.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No registered aggregate declares the command's type in its
    /// creation or update command union.
    #[error("no aggregate registered for command type {0}")]
    NoHandlerForCommand(&'static str),

    /// An update command addressed an aggregate with no events.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Concurrency retries exhausted: every attempt raced a concurrent
    /// writer on the same aggregate.
    #[error("concurrent write conflict: retries exhausted")]
    Concurrency,

    /// The sink's blocking lock could not be acquired. Not retried.
    #[error(transparent)]
    Locking(LockError),

    /// The aggregate rejected the command.
    #[error("{0}")]
    Domain(Box<dyn DomainError>),

    /// Event body/metadata wiring fault. Not retried.
    #[error(transparent)]
    Data(EventDataError),

    /// A synchronous event processor failed and aborted the sink.
    #[error("synchronous event processor failed: {0}")]
    Processor(HandlerError),

    /// Infrastructure failure, propagated unchanged.
    #[error(transparent)]
    Store(StoreError),
}

impl CommandError {
    /// True when the wrapped domain rejection marks an idempotent no-op.
    pub fn already_actioned(&self) -> bool {
        matches!(self, CommandError::Domain(e) if e.already_actioned())
    }
}

impl From<SinkError> for CommandError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Concurrency => CommandError::Concurrency,
            SinkError::Locking(e) => CommandError::Locking(e),
            SinkError::Data(e) => CommandError::Data(e),
            SinkError::Processor(e) => CommandError::Processor(e),
            SinkError::Store(e) => CommandError::Store(e),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        CommandError::Store(err)
    }
}

impl From<EventDataError> for CommandError {
    fn from(err: EventDataError) -> Self {
        CommandError::Data(err)
    }
}
