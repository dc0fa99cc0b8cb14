use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use qcflow_core::{AggregateId, EventId, UserId, WorkspaceId};

/// Current schema version stamped on new events.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Abstraction over system time so producers can be made deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that never hands out the same (or an earlier) instant twice.
///
/// Use one per producer when events must be strictly ordered by timestamp.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

/// Cross-cutting attributes carried by every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// User who triggered the event (absent for system-originated events).
    pub actor: Option<UserId>,
    /// Payload schema version for this event type.
    pub schema_version: u32,
    /// Producing component (e.g. "qc-checklist").
    pub source: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            actor: None,
            schema_version: CURRENT_SCHEMA_VERSION,
            source: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// The sole unit of state change.
///
/// Events are:
/// - **immutable** (fields are private; there are getters and no setters)
/// - **workspace-scoped** (one `workspace_id` for their entire lifetime)
/// - **causally linked** (`correlation_id` names the end-to-end transaction,
///   `causation_id` the event that directly caused this one)
///
/// Build them with [`DomainEvent::root`] for user/external triggers and
/// [`DomainEvent::caused_by`] for follow-ups produced while reacting to
/// another event. The builder methods (`with_*`, `at`) consume `self` and are
/// meant to be used before the event is handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: EventId,
    event_type: String,
    aggregate_id: AggregateId,
    workspace_id: WorkspaceId,
    occurred_at: DateTime<Utc>,
    correlation_id: EventId,
    causation_id: Option<EventId>,
    payload: JsonValue,
    #[serde(default)]
    metadata: EventMetadata,
}

impl DomainEvent {
    /// Start a new causal chain: `correlation_id = event_id`, no causation.
    pub fn root(
        workspace_id: WorkspaceId,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self::root_with_clock(&SystemClock, workspace_id, aggregate_id, event_type, payload)
    }

    pub fn root_with_clock(
        clock: &dyn Clock,
        workspace_id: WorkspaceId,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        let event_id = EventId::new();
        Self {
            event_id,
            event_type: event_type.into(),
            aggregate_id,
            workspace_id,
            occurred_at: clock.now(),
            correlation_id: event_id,
            causation_id: None,
            payload,
            metadata: EventMetadata::default(),
        }
    }

    /// Build the event produced while reacting to `parent`.
    ///
    /// Inherits the parent's workspace, correlation id and actor. The timestamp
    /// is never earlier than the parent's.
    pub fn caused_by(
        parent: &DomainEvent,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self::caused_by_with_clock(&SystemClock, parent, aggregate_id, event_type, payload)
    }

    pub fn caused_by_with_clock(
        clock: &dyn Clock,
        parent: &DomainEvent,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        let occurred_at = clock.now().max(parent.occurred_at);
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id,
            workspace_id: parent.workspace_id.clone(),
            occurred_at,
            correlation_id: parent.correlation_id,
            causation_id: Some(parent.event_id),
            payload,
            metadata: EventMetadata {
                actor: parent.metadata.actor.clone(),
                ..EventMetadata::default()
            },
        }
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.metadata.actor = Some(actor);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.attributes.insert(key.into(), value);
        self
    }

    /// Override the creation time (imports, deterministic tests).
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> EventId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<EventId> {
        self.causation_id
    }

    pub fn is_root(&self) -> bool {
        self.causation_id.is_none()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn actor(&self) -> Option<&UserId> {
        self.metadata.actor.as_ref()
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
