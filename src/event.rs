//! Event records and the tagged-JSON encoding shared by the store, the
//! gateway, and downstream consumers.
//!
//! Domain event unions are adjacently tagged serde enums
//! (`#[serde(tag = "type", content = "data")]`). On write the tag is split
//! out into the `event_type` column and only the `data` portion is
//! persisted as the body, so class identity never lives inside the body.
//! On read the tagged form is reconstructed for typed decoding.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EventDataError;

/// An immutable event as written to and read from the log.
///
/// Equality is structural: two events with identical fields are equal.
/// `body` holds the flat JSON payload of the domain event variant and
/// `metadata` the caller-supplied metadata record; both round-trip through
/// the serializer (validated before commit).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Globally unique event id, minted by the gateway.
    pub id: Uuid,
    /// The aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// 1-based, dense, per-aggregate ordinal.
    pub aggregate_sequence: i64,
    /// Aggregate type tag (e.g. `"survey"`).
    pub aggregate_type: String,
    /// Variant tag of the domain event union; the sole deserialization key.
    pub event_type: String,
    /// Creation timestamp. One shared instant per sunk batch.
    pub created_at: DateTime<Utc>,
    /// Flat JSON payload of the event variant.
    pub body: Value,
    /// Flat JSON metadata record.
    pub metadata: Value,
}

impl Event {
    /// Decode the payload into the domain event union `E`.
    ///
    /// Reconstructs the adjacently tagged form from `event_type` and
    /// `body`, then deserializes. The store applies upcasts before events
    /// are handed out, so `E` only needs to know current event classes.
    ///
    /// # Errors
    ///
    /// [`EventDataError::Body`] when the payload does not decode as `E`.
    pub fn payload<E: DeserializeOwned>(&self) -> Result<E, EventDataError> {
        serde_json::from_value(tagged(&self.event_type, self.body.clone())).map_err(|source| {
            EventDataError::Body {
                event_type: self.event_type.clone(),
                source,
            }
        })
    }

    /// Decode the metadata record as `M`.
    ///
    /// # Errors
    ///
    /// [`EventDataError::Metadata`] when the record does not decode as `M`.
    pub fn metadata_as<M: DeserializeOwned>(&self) -> Result<M, EventDataError> {
        serde_json::from_value(self.metadata.clone()).map_err(|source| {
            EventDataError::Metadata {
                event_type: self.event_type.clone(),
                class: std::any::type_name::<M>(),
                source,
            }
        })
    }
}

/// An [`Event`] paired with its store-global log position.
///
/// The global sequence is strictly increasing, dense, and assigned by the
/// store on insert; it totally orders the log in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    /// Store-global log position.
    pub sequence: i64,
    /// The event at that position.
    pub event: Event,
}

/// Rebuild the adjacently tagged JSON object from a tag and body.
///
/// A null body means the variant was fieldless, so the `data` key is
/// omitted, mirroring how serde serializes unit variants.
pub(crate) fn tagged(event_type: &str, body: Value) -> Value {
    if body.is_null() {
        serde_json::json!({ "type": event_type })
    } else {
        serde_json::json!({ "type": event_type, "data": body })
    }
}

/// Split a domain event into its variant tag and flat body.
///
/// The event must serialize as an adjacently tagged object. Unit variants
/// produce a null body.
///
/// # Errors
///
/// [`EventDataError::Shape`] when `E` does not serialize to the tagged
/// object form.
pub(crate) fn split_tagged<E: Serialize>(event: &E) -> Result<(String, Value), EventDataError> {
    let shape_err = || EventDataError::Shape {
        type_name: std::any::type_name::<E>(),
    };
    let value = serde_json::to_value(event).map_err(|_| shape_err())?;
    let obj = value.as_object().ok_or_else(shape_err)?;
    let event_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(shape_err)?
        .to_string();
    let body = obj.get("data").cloned().unwrap_or(Value::Null);
    Ok((event_type, body))
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{survey_event, SurveyEvent};
    use super::*;

    #[test]
    fn split_extracts_tag_and_flat_body() {
        let (tag, body) = split_tagged(&SurveyEvent::SurveyCreated {
            name: "pulse".into(),
        })
        .expect("split should succeed");
        assert_eq!(tag, "SurveyCreated");
        assert_eq!(body["name"], "pulse");
    }

    #[test]
    fn split_fieldless_variant_has_null_body() {
        let (tag, body) = split_tagged(&SurveyEvent::SurveyClosed).expect("split should succeed");
        assert_eq!(tag, "SurveyClosed");
        assert!(body.is_null());
    }

    #[test]
    fn split_rejects_untagged_values() {
        let err = split_tagged(&42u32).expect_err("a bare number is not a tagged event");
        assert!(matches!(err, EventDataError::Shape { .. }));
    }

    #[test]
    fn payload_roundtrips_through_the_row_encoding() {
        let original = SurveyEvent::SurveyRenamed { name: "q3".into() };
        let event = survey_event(2, &original);
        let decoded: SurveyEvent = event.payload().expect("decode should succeed");
        assert_eq!(decoded, original);
    }

    #[test]
    fn payload_roundtrips_fieldless_variant() {
        let event = survey_event(3, &SurveyEvent::SurveyClosed);
        let decoded: SurveyEvent = event.payload().expect("decode should succeed");
        assert_eq!(decoded, SurveyEvent::SurveyClosed);
    }

    #[test]
    fn payload_error_names_the_event_type() {
        let mut event = survey_event(1, &SurveyEvent::SurveyClosed);
        event.event_type = "NotARealEvent".to_string();
        let err = event
            .payload::<SurveyEvent>()
            .expect_err("unknown tag should not decode");
        assert!(err.to_string().contains("NotARealEvent"), "got: {err}");
    }

    #[test]
    fn events_compare_structurally() {
        let payload = SurveyEvent::SurveyCreated { name: "s".into() };
        let event = survey_event(1, &payload);
        assert_eq!(event, event.clone());

        let mut other = event.clone();
        other.aggregate_sequence = 2;
        assert_ne!(event, other);
    }

    #[test]
    fn created_at_serializes_as_iso_8601() {
        let event = survey_event(1, &SurveyEvent::SurveyClosed);
        let json = serde_json::to_value(event.created_at).expect("serialize should succeed");
        let text = json.as_str().expect("timestamps must serialize as strings");
        assert!(text.contains('T'), "expected ISO-8601 date-time, got: {text}");
    }
}
