use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use qcflow_core::{AggregateId, EventId, WorkspaceId};
use qcflow_events::DomainEvent;

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, transport, encoding). The
/// store never rejects an event on domain grounds: validation happens before
/// `append` is called.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Event ids are never reused; a second append of the same id is refused.
    #[error("event {0} was already appended")]
    DuplicateEvent(EventId),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Filter used by every query view. All set fields must match.
///
/// `causality_id` matches events whose correlation id **or** causation id
/// equals the given id. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub workspace_id: Option<WorkspaceId>,
    pub aggregate_id: Option<AggregateId>,
    pub event_type: Option<String>,
    pub causality_id: Option<EventId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workspace(mut self, workspace_id: WorkspaceId) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn causality(mut self, id: EventId) -> Self {
        self.causality_id = Some(id);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Reject malformed filters instead of answering them with an empty history.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(EventStoreError::InvalidQuery(format!(
                    "range start {since} is after range end {until}"
                )));
            }
        }
        if matches!(&self.event_type, Some(t) if t.trim().is_empty()) {
            return Err(EventStoreError::InvalidQuery("event type must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(workspace_id) = &self.workspace_id {
            if event.workspace_id() != workspace_id {
                return false;
            }
        }
        if let Some(aggregate_id) = &self.aggregate_id {
            if event.aggregate_id() != aggregate_id {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if event.event_type() != event_type {
                return false;
            }
        }
        if let Some(id) = self.causality_id {
            if event.correlation_id() != id && event.causation_id() != Some(id) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.occurred_at() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.occurred_at() > until {
                return false;
            }
        }
        true
    }
}

/// Append-only event log.
///
/// ## Append semantics
///
/// - `append` stores one event and fails only on storage/transport errors.
/// - `append_batch` stores several events as one unit (all or nothing).
/// - Concurrent appends (from different aggregates or workspaces) must not
///   corrupt the log.
///
/// ## Query semantics
///
/// Every view returns an owned vector in ascending `occurred_at` order, ties
/// broken by append order. Callers may do whatever they like with the result;
/// nothing is shared with the store's internal state. Query failures are
/// errors, never an empty result.
///
/// There is no update and no delete: history is never rewritten.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: DomainEvent) -> Result<(), EventStoreError>;

    async fn append_batch(&self, events: Vec<DomainEvent>) -> Result<(), EventStoreError>;

    /// The single query primitive the views are built on.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError>;

    async fn events_for_aggregate(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.query(&EventFilter::new().aggregate(aggregate_id.clone())).await
    }

    async fn events_for_workspace(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.query(&EventFilter::new().workspace(workspace_id.clone())).await
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.query(&EventFilter::new().since(since)).await
    }

    /// Events whose correlation id or causation id equals `id`.
    ///
    /// With a root event id this is the whole transaction; with any other
    /// event id it is that event's direct effects.
    async fn events_by_causality(&self, id: EventId) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.query(&EventFilter::new().causality(id)).await
    }

    async fn events_by_type(&self, event_type: &str) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.query(&EventFilter::new().event_type(event_type)).await
    }

    async fn events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.query(&EventFilter::new().since(start).until(end)).await
    }
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, event: DomainEvent) -> Result<(), EventStoreError> {
        (**self).append(event).await
    }

    async fn append_batch(&self, events: Vec<DomainEvent>) -> Result<(), EventStoreError> {
        (**self).append_batch(events).await
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).query(filter).await
    }
}
