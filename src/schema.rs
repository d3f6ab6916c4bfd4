//! The event-class registry: which tags exist, how each body is checked
//! before commit, which metadata class applies, and how superseded event
//! classes are migrated on read.
//!
//! There is no reflection here. Every domain declares its event unions up
//! front; the registry holds plain function pointers built from those
//! declarations.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::EventDataError;
use crate::event::{tagged, Event};
use crate::metadata::MetadataClass;

/// Per-tag registration: the union the tag belongs to, its round-trip
/// probe, and an optional narrower metadata class.
struct EventClass {
    union_name: &'static str,
    probe: fn(&str, &Value) -> Result<(), serde_json::Error>,
    metadata: Option<MetadataClass>,
}

/// A read-side migration from a superseded event class to its successor.
struct Upcast {
    target: &'static str,
    migrate: Box<dyn Fn(Value) -> Value + Send + Sync>,
}

fn probe_union<E: DeserializeOwned>(tag: &str, body: &Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<E>(tagged(tag, body.clone())).map(|_| ())
}

/// Registry of all event classes a store knows about.
///
/// Built once at startup via [`EventSchema::builder`] and shared by the
/// store for pre-commit validation, scan-filter expansion, and read-side
/// upcasting.
pub struct EventSchema {
    classes: HashMap<&'static str, EventClass>,
    upcasts: HashMap<&'static str, Upcast>,
}

impl EventSchema {
    /// Start declaring event classes.
    pub fn builder() -> EventSchemaBuilder {
        EventSchemaBuilder {
            classes: HashMap::new(),
            upcasts: HashMap::new(),
        }
    }

    /// Whether `event_type` is a registered tag.
    pub fn knows(&self, event_type: &str) -> bool {
        self.classes.contains_key(event_type)
    }

    /// Validate an event before it is committed.
    ///
    /// The body must deserialize back into the union its tag was
    /// registered under, and the metadata record must deserialize as the
    /// effective metadata class (the per-tag override if present,
    /// otherwise `default`).
    ///
    /// # Errors
    ///
    /// [`EventDataError::UnknownType`], [`EventDataError::Body`], or
    /// [`EventDataError::Metadata`]. All of them abort the enclosing sink.
    pub fn validate(
        &self,
        event: &Event,
        default: &MetadataClass,
    ) -> Result<(), EventDataError> {
        let class = self
            .classes
            .get(event.event_type.as_str())
            .ok_or_else(|| EventDataError::UnknownType(event.event_type.clone()))?;

        (class.probe)(&event.event_type, &event.body).map_err(|source| EventDataError::Body {
            event_type: event.event_type.clone(),
            source,
        })?;

        let metadata_class = class.metadata.as_ref().unwrap_or(default);
        metadata_class
            .validate(&event.metadata)
            .map_err(|source| EventDataError::Metadata {
                event_type: event.event_type.clone(),
                class: metadata_class.name(),
                source,
            })
    }

    /// Migrate a stored `(event_type, body)` pair to its current class.
    ///
    /// Applies registered upcasts to fixpoint, so chains of superseded
    /// classes land on the terminal class. Events without an upcast pass
    /// through unchanged.
    pub fn apply_upcasts(&self, event_type: String, body: Value) -> (String, Value) {
        let mut current = (event_type, body);
        // The hop bound caps pathological self-referential registrations.
        for _ in 0..self.upcasts.len() {
            match self.upcasts.get(current.0.as_str()) {
                Some(upcast) => {
                    current = (upcast.target.to_string(), (upcast.migrate)(current.1));
                }
                None => break,
            }
        }
        current
    }

    /// Expand a consumer's interest set with the superseded tags that
    /// migrate into it, so scans return history written under old classes.
    ///
    /// An empty interest set means "all classes" and stays empty.
    pub fn expand_interests(&self, event_types: &[&str]) -> Vec<String> {
        let mut expanded: Vec<String> = event_types.iter().map(|t| t.to_string()).collect();
        if expanded.is_empty() {
            return expanded;
        }
        for old in self.upcasts.keys() {
            if expanded.iter().any(|t| t == old) {
                continue;
            }
            let (terminal, _) = self.apply_upcasts(old.to_string(), Value::Null);
            if event_types.contains(&terminal.as_str()) {
                expanded.push(old.to_string());
            }
        }
        expanded
    }
}

impl std::fmt::Debug for EventSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self
            .classes
            .iter()
            .map(|(tag, class)| format!("{tag} ({})", class.union_name))
            .collect();
        tags.sort();
        f.debug_struct("EventSchema").field("tags", &tags).finish()
    }
}

/// Builder for [`EventSchema`].
pub struct EventSchemaBuilder {
    classes: HashMap<&'static str, EventClass>,
    upcasts: HashMap<&'static str, Upcast>,
}

impl EventSchemaBuilder {
    /// Register the variant tags of an adjacently tagged event union `E`.
    ///
    /// Each tag must match a variant of `E`; the probe reconstructs the
    /// tagged form and parses it, so a mismatch surfaces on the first
    /// validation rather than at read time.
    pub fn events<E: DeserializeOwned + 'static>(
        mut self,
        tags: &'static [&'static str],
    ) -> Self {
        for &tag in tags {
            self.classes.insert(
                tag,
                EventClass {
                    union_name: std::any::type_name::<E>(),
                    probe: probe_union::<E>,
                    metadata: None,
                },
            );
        }
        self
    }

    /// Narrow the metadata class for one event tag.
    ///
    /// Tags without an override are validated against the store's default
    /// metadata class.
    ///
    /// # Panics
    ///
    /// Panics if the tag was not registered first; overrides on unknown
    /// tags are wiring mistakes best caught at startup.
    pub fn metadata_override(mut self, tag: &'static str, class: MetadataClass) -> Self {
        let entry = self
            .classes
            .get_mut(tag)
            .unwrap_or_else(|| panic!("metadata override for unregistered event type {tag}"));
        entry.metadata = Some(class);
        self
    }

    /// Declare that events stored under `old` are read back as `new`,
    /// with `migrate` rewriting the body.
    ///
    /// Applied on every read path (`events_for`, `get_after`); the stored
    /// rows are never rewritten.
    pub fn upcast(
        mut self,
        old: &'static str,
        new: &'static str,
        migrate: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.upcasts.insert(
            old,
            Upcast {
                target: new,
                migrate: Box::new(migrate),
            },
        );
        self
    }

    /// Finish the declaration.
    pub fn build(self) -> EventSchema {
        EventSchema {
            classes: self.classes,
            upcasts: self.upcasts,
        }
    }
}
