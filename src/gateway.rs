//! The command gateway: routes each command to its registered aggregate,
//! rehydrates by replay, applies the decision functions, and persists the
//! resulting events atomically.
//!
//! The gateway is the only component that mints event ids, assigns
//! aggregate sequences, and stamps aggregate type tags. Concurrency
//! conflicts are retried a bounded number of times; every other error is
//! surfaced on the first occurrence.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::{AggregateDefinition, DomainCommand};
use crate::error::{CommandError, DomainError, EventDataError};
use crate::event::{split_tagged, Event};
use crate::metadata::Metadata;
use crate::store::EventStore;

/// One attempt at routing and executing a command, implemented for every
/// registered [`AggregateDefinition`]. Object-safe so the gateway can
/// hold aggregates with unrelated type parameters in one list.
#[async_trait]
trait CommandRoute<M>: Send + Sync {
    fn aggregate_type(&self) -> &'static str;

    /// Whether the runtime command belongs to this aggregate's creation
    /// or update command union.
    fn accepts(&self, command: &(dyn Any + Send + Sync)) -> bool;

    /// Execute one attempt: load, decide, sink. The caller retries on
    /// concurrency conflicts.
    async fn attempt(
        &self,
        command: &(dyn Any + Send + Sync),
        metadata: &M,
        metadata_value: &Value,
        store: &dyn EventStore,
    ) -> Result<(), CommandError>;
}

#[async_trait]
impl<S, CC, CE, UC, UE, Err, M> CommandRoute<M> for AggregateDefinition<S, CC, CE, UC, UE, Err, M>
where
    S: Send + Sync,
    CC: DomainCommand,
    UC: DomainCommand,
    CE: Serialize + DeserializeOwned + Send + Sync,
    UE: Serialize + DeserializeOwned + Send + Sync,
    Err: DomainError,
    M: Send + Sync + 'static,
{
    fn aggregate_type(&self) -> &'static str {
        AggregateDefinition::aggregate_type(self)
    }

    fn accepts(&self, command: &(dyn Any + Send + Sync)) -> bool {
        command.is::<CC>() || command.is::<UC>()
    }

    async fn attempt(
        &self,
        command: &(dyn Any + Send + Sync),
        metadata: &M,
        metadata_value: &Value,
        store: &dyn EventStore,
    ) -> Result<(), CommandError> {
        if let Some(creation) = command.downcast_ref::<CC>() {
            let event = self
                .handle_create(creation, metadata)
                .map_err(|e| CommandError::Domain(Box::new(e)))?;
            let (event_type, body) = split_tagged(&event)?;
            let row = Event {
                id: Uuid::new_v4(),
                aggregate_id: creation.aggregate_id(),
                aggregate_sequence: 1,
                aggregate_type: self.aggregate_type().to_string(),
                event_type,
                created_at: Utc::now(),
                body,
                metadata: metadata_value.clone(),
            };
            store.sink(vec![row]).await.map_err(CommandError::from)
        } else if let Some(update) = command.downcast_ref::<UC>() {
            let aggregate_id = update.aggregate_id();
            let history = store.events_for(aggregate_id).await?;
            let Some(last) = history.last() else {
                return Err(CommandError::AggregateNotFound(aggregate_id));
            };
            let next_sequence = last.aggregate_sequence + 1;

            let state = self.rehydrate(&history)?;
            let events = self
                .handle_update(&state, update, metadata)
                .map_err(|e| CommandError::Domain(Box::new(e)))?;
            if events.is_empty() {
                return Ok(());
            }

            // One shared timestamp per batch.
            let created_at = Utc::now();
            let rows = events
                .iter()
                .enumerate()
                .map(|(offset, event)| {
                    let (event_type, body) = split_tagged(event)?;
                    Ok(Event {
                        id: Uuid::new_v4(),
                        aggregate_id,
                        aggregate_sequence: next_sequence + offset as i64,
                        aggregate_type: self.aggregate_type().to_string(),
                        event_type,
                        created_at,
                        body,
                        metadata: metadata_value.clone(),
                    })
                })
                .collect::<Result<Vec<_>, EventDataError>>()?;
            store.sink(rows).await.map_err(CommandError::from)
        } else {
            Err(CommandError::NoHandlerForCommand(self.aggregate_type()))
        }
    }
}

/// Routes commands to registered aggregates and executes them against the
/// event store.
pub struct CommandGateway<M: Metadata> {
    store: Arc<dyn EventStore>,
    routes: Vec<Arc<dyn CommandRoute<M>>>,
    max_attempts: u32,
}

impl<M: Metadata> CommandGateway<M> {
    /// A gateway over `store` with no registered aggregates and the
    /// default bound of three attempts per command.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            routes: Vec::new(),
            max_attempts: 3,
        }
    }

    /// Register an aggregate definition.
    ///
    /// The gateway selects a definition by matching the runtime command
    /// type against each definition's creation and update command
    /// unions, in registration order.
    pub fn register<S, CC, CE, UC, UE, Err>(
        mut self,
        definition: AggregateDefinition<S, CC, CE, UC, UE, Err, M>,
    ) -> Self
    where
        S: Send + Sync + 'static,
        CC: DomainCommand,
        UC: DomainCommand,
        CE: Serialize + DeserializeOwned + Send + Sync + 'static,
        UE: Serialize + DeserializeOwned + Send + Sync + 'static,
        Err: DomainError,
    {
        self.routes.push(Arc::new(definition));
        self
    }

    /// Override how many times a command is attempted when every attempt
    /// ends in a concurrency conflict.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Execute `command` with `metadata`.
    ///
    /// On a concurrency conflict the whole attempt, including reload and
    /// rehydration, is repeated up to the configured bound. Lock
    /// failures, domain rejections, and event data faults are returned
    /// without retry.
    pub async fn dispatch<C: DomainCommand>(
        &self,
        command: C,
        metadata: M,
    ) -> Result<(), CommandError> {
        let metadata_value =
            serde_json::to_value(&metadata).map_err(|source| EventDataError::Metadata {
                event_type: "*".to_string(),
                class: std::any::type_name::<M>(),
                source,
            })?;

        let any: &(dyn Any + Send + Sync) = &command;
        let route = self
            .routes
            .iter()
            .find(|route| route.accepts(any))
            .ok_or_else(|| CommandError::NoHandlerForCommand(std::any::type_name::<C>()))?;

        let mut attempt = 1;
        loop {
            match route
                .attempt(any, &metadata, &metadata_value, self.store.as_ref())
                .await
            {
                Err(CommandError::Concurrency) if attempt < self.max_attempts => {
                    tracing::debug!(
                        aggregate_type = route.aggregate_type(),
                        command = std::any::type_name::<C>(),
                        attempt,
                        "concurrent write conflict, retrying dispatch"
                    );
                    attempt += 1;
                }
                Err(error) => {
                    tracing::debug!(
                        aggregate_type = route.aggregate_type(),
                        command = std::any::type_name::<C>(),
                        error = %error,
                        "command rejected"
                    );
                    return Err(error);
                }
                Ok(()) => return Ok(()),
            }
        }
    }
}

impl<M: Metadata> std::fmt::Debug for CommandGateway<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<_> = self.routes.iter().map(|r| r.aggregate_type()).collect();
        f.debug_struct("CommandGateway")
            .field("routes", &routes)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::*;
    use crate::error::{SinkError, StoreError};
    use crate::event::SequencedEvent;
    use crate::memory::InMemoryEventStore;
    use crate::metadata::{EmptyMetadata, MetadataClass, StandardMetadata};
    use crate::schema::EventSchema;
    use crate::store::EventSource;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn survey_schema() -> EventSchema {
        EventSchema::builder()
            .events::<SurveyCreation>(&["SurveyCreated"])
            .events::<SurveyUpdate>(&["SurveyRenamed", "SurveyClosed"])
            .build()
    }

    fn survey_store() -> InMemoryEventStore {
        InMemoryEventStore::builder(survey_schema())
            .default_metadata(MetadataClass::of::<EmptyMetadata>())
            .build()
    }

    fn survey_gateway(store: &InMemoryEventStore) -> CommandGateway<EmptyMetadata> {
        CommandGateway::new(Arc::new(store.clone())).register(survey_definition())
    }

    #[tokio::test]
    async fn create_then_update_builds_the_stream() {
        let store = survey_store();
        let gateway = survey_gateway(&store);
        let id = Uuid::new_v4();

        gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: id,
                    name: "pulse".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect("create should succeed");
        gateway
            .dispatch(
                ReviseSurvey::Rename {
                    survey_id: id,
                    name: "pulse-2".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect("rename should succeed");

        let history = store.events_for(id).await.expect("read");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "SurveyCreated");
        assert_eq!(history[0].aggregate_sequence, 1);
        assert_eq!(history[1].event_type, "SurveyRenamed");
        assert_eq!(history[1].aggregate_sequence, 2);
        assert!(history.iter().all(|e| e.aggregate_type == "survey"));
        assert_eq!(store.last_sequence(&[]).await.expect("stats"), 2);
    }

    #[tokio::test]
    async fn duplicate_create_is_a_concurrency_conflict() {
        let store = survey_store();
        let gateway = survey_gateway(&store);
        let id = Uuid::new_v4();
        let make = || CreateSurvey::Create {
            survey_id: id,
            name: "pulse".into(),
        };

        gateway
            .dispatch(make(), EmptyMetadata {})
            .await
            .expect("first create should succeed");
        let err = gateway
            .dispatch(make(), EmptyMetadata {})
            .await
            .expect_err("second create must conflict");
        assert!(matches!(err, CommandError::Concurrency));
    }

    #[tokio::test]
    async fn update_of_unknown_aggregate_is_not_found() {
        let store = survey_store();
        let gateway = survey_gateway(&store);
        let id = Uuid::new_v4();

        let err = gateway
            .dispatch(
                ReviseSurvey::Close { survey_id: id },
                EmptyMetadata {},
            )
            .await
            .expect_err("nothing to update");
        assert!(matches!(err, CommandError::AggregateNotFound(found) if found == id));
    }

    #[tokio::test]
    async fn unregistered_command_has_no_handler() {
        let store = survey_store();
        let gateway: CommandGateway<EmptyMetadata> = CommandGateway::new(Arc::new(store));

        let err = gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: Uuid::new_v4(),
                    name: "s".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect_err("no aggregate registered");
        assert!(matches!(err, CommandError::NoHandlerForCommand(_)));
    }

    #[tokio::test]
    async fn domain_rejection_passes_through() {
        let store = survey_store();
        let gateway = survey_gateway(&store);
        let id = Uuid::new_v4();

        gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: id,
                    name: "s".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect("create should succeed");
        gateway
            .dispatch(ReviseSurvey::Close { survey_id: id }, EmptyMetadata {})
            .await
            .expect("close should succeed");

        let err = gateway
            .dispatch(ReviseSurvey::Close { survey_id: id }, EmptyMetadata {})
            .await
            .expect_err("closing twice is rejected");
        assert!(matches!(err, CommandError::Domain(_)));
        assert!(err.already_actioned(), "AlreadyClosed marks a no-op");

        // The rejected command wrote nothing.
        let history = store.events_for(id).await.expect("read");
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn metadata_of_the_wrong_class_writes_no_row() {
        // Store validates against StandardMetadata, dispatch supplies the
        // empty record.
        let store = InMemoryEventStore::builder(survey_schema())
            .default_metadata(MetadataClass::of::<StandardMetadata>())
            .build();
        let gateway: CommandGateway<EmptyMetadata> =
            CommandGateway::new(Arc::new(store.clone())).register(survey_definition());
        let id = Uuid::new_v4();

        let err = gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: id,
                    name: "s".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect_err("metadata class mismatch must fail");
        assert!(matches!(
            err,
            CommandError::Data(EventDataError::Metadata { .. })
        ));
        assert!(store.events_for(id).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn metadata_record_is_stamped_on_every_event() {
        let store = InMemoryEventStore::builder(
            EventSchema::builder()
                .events::<AuditCreation>(&["AuditTrailOpened"])
                .events::<AuditUpdate>(&["EntryRecorded"])
                .build(),
        )
        .build();
        let gateway: CommandGateway<StandardMetadata> =
            CommandGateway::new(Arc::new(store.clone())).register(audit_definition());

        let trail_id = Uuid::new_v4();
        let metadata = StandardMetadata::new(Uuid::new_v4(), Uuid::new_v4());
        gateway
            .dispatch(OpenAuditTrail { trail_id }, metadata.clone())
            .await
            .expect("open should succeed");

        let history = store.events_for(trail_id).await.expect("read");
        let stored: StandardMetadata = history[0].metadata_as().expect("decode metadata");
        assert_eq!(stored, metadata);
        // The metadata-receiving aggregate also folded it into the body.
        assert_eq!(history[0].body["account_id"], serde_json::json!(metadata.account_id));
    }

    /// Store wrapper that reports a concurrency conflict for the first
    /// `failures` sinks, then delegates.
    struct ContendedStore {
        inner: InMemoryEventStore,
        remaining: AtomicU32,
    }

    #[async_trait]
    impl EventSource for ContendedStore {
        async fn get_after(
            &self,
            sequence: i64,
            event_types: &[&str],
            batch_size: usize,
        ) -> Result<Vec<SequencedEvent>, StoreError> {
            self.inner.get_after(sequence, event_types, batch_size).await
        }

        async fn last_sequence(&self, event_types: &[&str]) -> Result<i64, StoreError> {
            self.inner.last_sequence(event_types).await
        }
    }

    #[async_trait]
    impl EventStore for ContendedStore {
        async fn sink(&self, events: Vec<crate::event::Event>) -> Result<(), SinkError> {
            if self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::Concurrency);
            }
            self.inner.sink(events).await
        }

        async fn events_for(&self, aggregate_id: Uuid) -> Result<Vec<crate::event::Event>, StoreError> {
            self.inner.events_for(aggregate_id).await
        }
    }

    #[tokio::test]
    async fn concurrency_conflicts_are_retried_to_success() {
        let inner = survey_store();
        let store = Arc::new(ContendedStore {
            inner: inner.clone(),
            remaining: AtomicU32::new(2),
        });
        let gateway: CommandGateway<EmptyMetadata> =
            CommandGateway::new(store).register(survey_definition());
        let id = Uuid::new_v4();

        gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: id,
                    name: "s".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect("third attempt should land");
        assert_eq!(inner.events_for(id).await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let inner = survey_store();
        let store = Arc::new(ContendedStore {
            inner: inner.clone(),
            remaining: AtomicU32::new(u32::MAX),
        });
        let gateway: CommandGateway<EmptyMetadata> = CommandGateway::new(store)
            .register(survey_definition())
            .with_max_attempts(2);

        let err = gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: Uuid::new_v4(),
                    name: "s".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect_err("conflicts never clear");
        assert!(matches!(err, CommandError::Concurrency));
    }

    #[tokio::test]
    async fn update_batch_shares_one_timestamp_and_sequences_densely() {
        let store = survey_store();
        let multi = AggregateDefinition::<
            Survey,
            CreateSurvey,
            SurveyCreation,
            ReviseSurvey,
            SurveyUpdate,
            SurveyError,
            EmptyMetadata,
        >::new(
            "survey",
            |command: &CreateSurvey| {
                let CreateSurvey::Create { name, .. } = command;
                Ok(SurveyCreation::SurveyCreated { name: name.clone() })
            },
            |event: &SurveyCreation| {
                let SurveyCreation::SurveyCreated { name } = event;
                Survey {
                    name: name.clone(),
                    closed: false,
                }
            },
            // Renaming also closes: two events from one command.
            |_state, command: &ReviseSurvey| match command {
                ReviseSurvey::Rename { name, .. } => Ok(vec![
                    SurveyUpdate::SurveyRenamed { name: name.clone() },
                    SurveyUpdate::SurveyClosed,
                ]),
                ReviseSurvey::Close { .. } => Ok(vec![SurveyUpdate::SurveyClosed]),
            },
            |state, _event| state,
        );
        let gateway: CommandGateway<EmptyMetadata> =
            CommandGateway::new(Arc::new(store.clone())).register(multi);

        let id = Uuid::new_v4();
        gateway
            .dispatch(
                CreateSurvey::Create {
                    survey_id: id,
                    name: "a".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect("create");
        gateway
            .dispatch(
                ReviseSurvey::Rename {
                    survey_id: id,
                    name: "b".into(),
                },
                EmptyMetadata {},
            )
            .await
            .expect("rename");

        let history = store.events_for(id).await.expect("read");
        let ordinals: Vec<i64> = history.iter().map(|e| e.aggregate_sequence).collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        assert_eq!(history[1].created_at, history[2].created_at);
        assert!(history[1].id != history[2].id, "event ids stay unique");
    }
}
