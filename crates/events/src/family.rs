//! Typed event families.
//!
//! The bus and the store are string keyed (`event_type` + opaque JSON payload),
//! which matches what is on the wire and on disk. Consumers should not pass
//! raw JSON around: they decode into one enum variant per `event_type` as soon
//! as an event is received.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use qcflow_core::AggregateId;
use qcflow_core::WorkspaceId;

use crate::DomainEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("event type '{event_type}' is not part of the {family} family")]
    UnknownType {
        family: &'static str,
        event_type: String,
    },

    #[error("malformed '{event_type}' payload: {message}")]
    Payload { event_type: String, message: String },

    #[error("could not encode event: {0}")]
    Encode(String),
}

/// A closed set of event types with strongly typed payloads.
///
/// Implementations are usually an adjacently tagged serde enum
/// (`#[serde(tag = "type", content = "data")]`) and delegate to
/// [`decode_tagged`] / [`encode_tagged`].
pub trait EventFamily: Sized + Send + Sync + 'static {
    /// Human-readable family name for diagnostics.
    const FAMILY: &'static str;

    /// Every `event_type` string the family understands.
    fn event_types() -> &'static [&'static str];

    fn decode(event: &DomainEvent) -> Result<Self, DecodeError>;

    fn event_type(&self) -> &'static str;

    fn to_payload(&self) -> Result<JsonValue, DecodeError>;

    /// Wrap this variant in a new root event.
    fn into_root(
        self,
        workspace_id: WorkspaceId,
        aggregate_id: AggregateId,
    ) -> Result<DomainEvent, DecodeError> {
        let payload = self.to_payload()?;
        Ok(DomainEvent::root(workspace_id, aggregate_id, self.event_type(), payload))
    }

    /// Wrap this variant in an event caused by `parent`.
    fn into_caused_by(
        self,
        parent: &DomainEvent,
        aggregate_id: AggregateId,
    ) -> Result<DomainEvent, DecodeError> {
        let payload = self.to_payload()?;
        Ok(DomainEvent::caused_by(parent, aggregate_id, self.event_type(), payload))
    }
}

/// Decode an adjacently tagged enum from an event's type + payload.
pub fn decode_tagged<T: DeserializeOwned>(
    family: &'static str,
    known: &[&str],
    event: &DomainEvent,
) -> Result<T, DecodeError> {
    if !known.contains(&event.event_type()) {
        return Err(DecodeError::UnknownType {
            family,
            event_type: event.event_type().to_string(),
        });
    }

    let tagged = serde_json::json!({
        "type": event.event_type(),
        "data": event.payload(),
    });
    serde_json::from_value(tagged).map_err(|e| DecodeError::Payload {
        event_type: event.event_type().to_string(),
        message: e.to_string(),
    })
}

/// Inverse of [`decode_tagged`]: returns the bare payload of a variant.
pub fn encode_tagged<T: Serialize>(value: &T) -> Result<JsonValue, DecodeError> {
    let mut tagged = serde_json::to_value(value).map_err(|e| DecodeError::Encode(e.to_string()))?;
    match tagged.get_mut("data") {
        Some(data) => Ok(data.take()),
        None => Ok(JsonValue::Object(Default::default())),
    }
}
