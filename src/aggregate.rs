//! The aggregate algebra: how commands become events and events become
//! state.
//!
//! An aggregate is described by four functions (`create`, `created`,
//! `update`, `updated`) over its creation-command, creation-event,
//! update-command, and update-event unions. The functions must be pure
//! decision/fold logic: no I/O, no clocks, no id generation (the gateway
//! mints ids, sequences, and timestamps). Constructors cover the common
//! shapes: plain, projection-aware, stateless, and metadata-receiving.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::EventDataError;
use crate::event::Event;

/// A command addressed to exactly one aggregate.
///
/// Implemented by each aggregate's creation-command and update-command
/// unions. The gateway routes on the concrete command type and uses
/// `aggregate_id` to locate the event stream.
pub trait DomainCommand: std::any::Any + std::fmt::Debug + Send + Sync + 'static {
    /// The aggregate this command addresses.
    fn aggregate_id(&self) -> Uuid;
}

type CreateFn<CC, CE, Err, M> = Arc<dyn Fn(&CC, &M) -> Result<CE, Err> + Send + Sync>;
type CreatedFn<CE, S> = Arc<dyn Fn(&CE) -> S + Send + Sync>;
type UpdateFn<S, UC, UE, Err, M> = Arc<dyn Fn(&S, &UC, &M) -> Result<Vec<UE>, Err> + Send + Sync>;
type UpdatedFn<S, UE> = Arc<dyn Fn(S, &UE) -> S + Send + Sync>;

/// One registered aggregate type: its four functions plus its command and
/// event unions.
///
/// Type parameters: state `S`, creation command `CC`, creation event
/// `CE`, update command `UC`, update event `UE`, rejection `Err`, and the
/// metadata record `M` commands are dispatched with.
pub struct AggregateDefinition<S, CC, CE, UC, UE, Err, M> {
    aggregate_type: &'static str,
    create: CreateFn<CC, CE, Err, M>,
    created: CreatedFn<CE, S>,
    update: UpdateFn<S, UC, UE, Err, M>,
    updated: UpdatedFn<S, UE>,
}

impl<S, CC, CE, UC, UE, Err, M> Clone for AggregateDefinition<S, CC, CE, UC, UE, Err, M> {
    fn clone(&self) -> Self {
        Self {
            aggregate_type: self.aggregate_type,
            create: self.create.clone(),
            created: self.created.clone(),
            update: self.update.clone(),
            updated: self.updated.clone(),
        }
    }
}

impl<S, CC, CE, UC, UE, Err, M> AggregateDefinition<S, CC, CE, UC, UE, Err, M> {
    /// The plain shape: decision functions that see only command and
    /// state.
    pub fn new(
        aggregate_type: &'static str,
        create: impl Fn(&CC) -> Result<CE, Err> + Send + Sync + 'static,
        created: impl Fn(&CE) -> S + Send + Sync + 'static,
        update: impl Fn(&S, &UC) -> Result<Vec<UE>, Err> + Send + Sync + 'static,
        updated: impl Fn(S, &UE) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            aggregate_type,
            create: Arc::new(move |cc, _m| create(cc)),
            created: Arc::new(created),
            update: Arc::new(move |s, uc, _m| update(s, uc)),
            updated: Arc::new(updated),
        }
    }

    /// The projection-aware shape: decisions may consult a read-only
    /// collaborator `P` (e.g. "is this survey name taken?"). Aggregates
    /// never write through the projection.
    pub fn with_projection<P: Send + Sync + 'static>(
        aggregate_type: &'static str,
        projection: Arc<P>,
        create: impl Fn(&P, &CC) -> Result<CE, Err> + Send + Sync + 'static,
        created: impl Fn(&CE) -> S + Send + Sync + 'static,
        update: impl Fn(&P, &S, &UC) -> Result<Vec<UE>, Err> + Send + Sync + 'static,
        updated: impl Fn(S, &UE) -> S + Send + Sync + 'static,
    ) -> Self {
        let create_projection = projection.clone();
        Self {
            aggregate_type,
            create: Arc::new(move |cc, _m| create(&create_projection, cc)),
            created: Arc::new(created),
            update: Arc::new(move |s, uc, _m| update(&projection, s, uc)),
            updated: Arc::new(updated),
        }
    }

    /// The stateless shape: a singleton whose state never changes, so
    /// `updated` is identity and `created` always yields `instance`.
    pub fn stateless(
        aggregate_type: &'static str,
        instance: S,
        create: impl Fn(&CC) -> Result<CE, Err> + Send + Sync + 'static,
        update: impl Fn(&S, &UC) -> Result<Vec<UE>, Err> + Send + Sync + 'static,
    ) -> Self
    where
        S: Clone + Send + Sync + 'static,
    {
        Self {
            aggregate_type,
            create: Arc::new(move |cc, _m| create(cc)),
            created: Arc::new(move |_ce| instance.clone()),
            update: Arc::new(move |s, uc, _m| update(s, uc)),
            updated: Arc::new(|s, _ue| s),
        }
    }

    /// The metadata-receiving shape: decisions also see the command's
    /// metadata record, for audit fields and the like.
    pub fn with_metadata(
        aggregate_type: &'static str,
        create: impl Fn(&CC, &M) -> Result<CE, Err> + Send + Sync + 'static,
        created: impl Fn(&CE) -> S + Send + Sync + 'static,
        update: impl Fn(&S, &UC, &M) -> Result<Vec<UE>, Err> + Send + Sync + 'static,
        updated: impl Fn(S, &UE) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            aggregate_type,
            create: Arc::new(create),
            created: Arc::new(created),
            update: Arc::new(update),
            updated: Arc::new(updated),
        }
    }

    /// The aggregate type tag stamped on every event of this aggregate.
    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    pub(crate) fn handle_create(&self, command: &CC, metadata: &M) -> Result<CE, Err> {
        (self.create)(command, metadata)
    }

    pub(crate) fn handle_update(
        &self,
        state: &S,
        command: &UC,
        metadata: &M,
    ) -> Result<Vec<UE>, Err> {
        (self.update)(state, command, metadata)
    }

    /// Rebuild current state from an aggregate's full event history.
    ///
    /// The first event must decode as a creation event, the rest as
    /// update events; the caller guarantees the slice is non-empty and
    /// in aggregate-sequence order.
    pub(crate) fn rehydrate(&self, events: &[Event]) -> Result<S, EventDataError>
    where
        CE: serde::de::DeserializeOwned,
        UE: serde::de::DeserializeOwned,
    {
        let (first, rest) = match events.split_first() {
            Some(split) => split,
            None => {
                return Err(EventDataError::Body {
                    event_type: String::new(),
                    source: serde::de::Error::custom("cannot rehydrate from an empty history"),
                })
            }
        };
        let creation: CE = first.payload()?;
        let mut state = (self.created)(&creation);
        for event in rest {
            let update: UE = event.payload()?;
            state = (self.updated)(state, &update);
        }
        Ok(state)
    }
}

impl<S, CC, CE, UC, UE, Err, M> std::fmt::Debug for AggregateDefinition<S, CC, CE, UC, UE, Err, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateDefinition")
            .field("aggregate_type", &self.aggregate_type)
            .finish()
    }
}
