//! Event dispatch to consumer handlers.
//!
//! An [`EventHandler`] is what a projector or saga exposes to the core: a
//! `handle` function plus the set of event classes it cares about. An
//! [`EventProcessor`] binds one or more handlers and delivers each event
//! to the interested ones in registration order. Processors run either
//! synchronously inside the sink transaction or behind a polling
//! consumer; in both cases delivery is at-least-once, so handlers must
//! tolerate seeing the same event twice.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::event::SequencedEvent;

/// A consumer of events: a projector, a saga, or any other reactor.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event class tags this handler cares about. Empty means all.
    fn event_types(&self) -> &'static [&'static str] {
        &[]
    }

    /// Consume one event. Returning an error stops the enclosing
    /// processor: inside a sink it rolls the transaction back, on the
    /// async path it leaves the bookmark so the event is re-delivered.
    async fn handle(&self, event: &SequencedEvent) -> Result<(), HandlerError>;
}

/// Adapter for handlers written as plain closures.
pub struct SyncHandler<F> {
    event_types: &'static [&'static str],
    apply: F,
}

impl<F> SyncHandler<F>
where
    F: Fn(&SequencedEvent) -> Result<(), HandlerError> + Send + Sync,
{
    /// A handler interested in `event_types` (empty = all) that applies
    /// each event through `apply`.
    pub fn new(event_types: &'static [&'static str], apply: F) -> Self {
        Self { event_types, apply }
    }
}

#[async_trait]
impl<F> EventHandler for SyncHandler<F>
where
    F: Fn(&SequencedEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn event_types(&self) -> &'static [&'static str] {
        self.event_types
    }

    async fn handle(&self, event: &SequencedEvent) -> Result<(), HandlerError> {
        (self.apply)(event)
    }
}

/// Ordered fan-out over one or more handlers.
///
/// The processor's own interest set is the union of its handlers'; a
/// single catch-all handler makes the whole processor catch-all, which
/// widens the scans a polling consumer issues for it.
pub struct EventProcessor {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventProcessor {
    /// A processor over a single handler.
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            handlers: vec![handler],
        }
    }

    /// A processor over several handlers, invoked in the given order.
    pub fn of(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers }
    }

    /// Combined interest set. Empty when any handler is catch-all.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut combined = Vec::new();
        for handler in &self.handlers {
            let types = handler.event_types();
            if types.is_empty() {
                return Vec::new();
            }
            for &tag in types {
                if !combined.contains(&tag) {
                    combined.push(tag);
                }
            }
        }
        combined
    }

    /// Deliver one event to every interested handler, in registration
    /// order. Stops at the first handler error.
    pub async fn process(&self, event: &SequencedEvent) -> Result<(), HandlerError> {
        for handler in &self.handlers {
            let types = handler.event_types();
            if types.is_empty() || types.contains(&event.event.event_type.as_str()) {
                handler.handle(event).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("handlers", &self.handlers.len())
            .field("event_types", &self.event_types())
            .finish()
    }
}
