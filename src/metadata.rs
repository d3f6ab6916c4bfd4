//! Metadata records stamped on every event, and the named class probes the
//! store uses to validate them before commit.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum contract for a metadata record.
///
/// Callers supply any serde record that can say which account (or other
/// correlation scope) the command ran under. The store is configured with
/// a default [`MetadataClass`]; individual event classes may register a
/// narrower one on the event schema.
pub trait Metadata:
    Serialize + DeserializeOwned + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// The account/correlation identifier, if this record carries one.
    fn account_id(&self) -> Option<Uuid>;
}

/// The standard metadata record: who ran the command, on whose behalf,
/// and how it chains to the operation that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardMetadata {
    /// Account the command executed under.
    pub account_id: Uuid,
    /// Identity that issued the command (user or service principal).
    pub executor_id: Uuid,
    /// Correlates this command with the request that spawned it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<Uuid>,
    /// Event or command that directly caused this one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<Uuid>,
}

impl StandardMetadata {
    /// Metadata for a command executed by `executor_id` under `account_id`.
    pub fn new(account_id: Uuid, executor_id: Uuid) -> Self {
        Self {
            account_id,
            executor_id,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }
}

impl Metadata for StandardMetadata {
    fn account_id(&self) -> Option<Uuid> {
        Some(self.account_id)
    }
}

/// Metadata that carries nothing. Useful for internal and system commands
/// that have no account scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyMetadata {}

impl Metadata for EmptyMetadata {
    fn account_id(&self) -> Option<Uuid> {
        None
    }
}

/// A named, type-erased validation probe for a metadata class.
///
/// Stores keep one of these as their default; the event schema may map
/// individual event types to a narrower class. Validation simply checks
/// that a metadata JSON value deserializes as the class.
#[derive(Clone, Copy)]
pub struct MetadataClass {
    name: &'static str,
    probe: fn(&serde_json::Value) -> Result<(), serde_json::Error>,
}

fn probe<M: Metadata>(value: &serde_json::Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<M>(value.clone()).map(|_| ())
}

impl MetadataClass {
    /// The class for a concrete metadata record type.
    pub fn of<M: Metadata>() -> Self {
        Self {
            name: std::any::type_name::<M>(),
            probe: probe::<M>,
        }
    }

    /// Rust type name of the class, used in error messages.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check that `value` deserializes as this class.
    pub fn validate(&self, value: &serde_json::Value) -> Result<(), serde_json::Error> {
        (self.probe)(value)
    }
}

impl std::fmt::Debug for MetadataClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataClass").field("name", &self.name).finish()
    }
}
