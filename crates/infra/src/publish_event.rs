//! The publish use case: the single authorized write path.
//!
//! ```text
//! execute(event)
//!   ↓
//! 1. Validate (workspace, permissions, parent of each follow-up);
//!    nothing written on failure
//!   ↓
//! 2. Append to the store and await completion → `Committed`
//!   ↓
//! 3. Publish the committed events on the workspace bus
//! ```
//!
//! Publishing requires a `Committed` receipt, and only a successful append
//! produces one. Publishing an event that is not durable yet is therefore not
//! expressible, and neither is running append and publish side by side. The
//! receipt never leaves this crate:
//!
//! ```compile_fail
//! use qcflow_infra::publish_event::Committed;
//! ```

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument};

use qcflow_core::{AggregateId, EventId, WorkspaceId};
use qcflow_events::{
    BusError, DecodeError, DispatchReport, DomainEvent, EventBus, EventFamily, WorkspaceEventBus,
};

use crate::event_store::{EventFilter, EventStore, EventStoreError};
use crate::runtime::{WorkspaceContext, WorkspaceRole};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event {event_id} targets workspace '{event_workspace}', runtime serves '{runtime_workspace}'")]
    WorkspaceMismatch {
        event_id: EventId,
        runtime_workspace: WorkspaceId,
        event_workspace: WorkspaceId,
    },

    #[error("cannot publish an empty batch")]
    EmptyBatch,

    #[error("role '{role}' may not originate events in workspace '{workspace_id}'")]
    Forbidden {
        workspace_id: WorkspaceId,
        role: WorkspaceRole,
    },

    /// The cause is not in this workspace's log (nor earlier in the batch),
    /// or it belongs to another transaction.
    #[error("event {event_id} names cause {causation_id}, which is not part of its transaction in this workspace")]
    UnknownParent { event_id: EventId, causation_id: EventId },

    /// Nothing was appended.
    #[error("parent lookup failed: {0}")]
    ParentLookup(EventStoreError),

    /// Nothing was published.
    #[error("append failed: {0}")]
    Append(#[from] EventStoreError),

    #[error(transparent)]
    Encode(#[from] DecodeError),

    /// The events are durable but were not delivered.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Proof that a set of events has been appended.
///
/// Only this module can build one, and only after the store confirmed the
/// append.
#[must_use = "committed events must be published"]
#[derive(Debug)]
pub(crate) struct Committed {
    events: Vec<DomainEvent>,
}

/// Outcome of a successful publish operation.
///
/// Handler failures live in `dispatch`; they never turn the operation into an
/// error since the events are already durable.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub events: Vec<DomainEvent>,
    pub dispatch: DispatchReport,
}

impl PublishReceipt {
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(DomainEvent::event_id).collect()
    }
}

/// Append-then-publish use case bound to one workspace runtime.
///
/// Cheap to clone; handlers that react to events keep a clone and call
/// [`PublishEvent::react`].
#[derive(Clone)]
pub struct PublishEvent {
    context: Arc<WorkspaceContext>,
    store: Arc<dyn EventStore>,
    bus: Arc<WorkspaceEventBus>,
}

impl PublishEvent {
    pub(crate) fn new(
        context: Arc<WorkspaceContext>,
        store: Arc<dyn EventStore>,
        bus: Arc<WorkspaceEventBus>,
    ) -> Self {
        Self { context, store, bus }
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.context.workspace_id
    }

    pub fn context(&self) -> &WorkspaceContext {
        &self.context
    }

    /// Append one event, then publish it.
    #[instrument(
        skip(self, event),
        fields(
            workspace_id = %self.context.workspace_id,
            event_id = %event.event_id(),
            event_type = %event.event_type()
        ),
        err
    )]
    pub async fn execute(&self, event: DomainEvent) -> Result<PublishReceipt, PublishError> {
        let events = self.prepare(vec![event]).await?;
        let committed = self.append(events).await?;
        self.publish(committed).await
    }

    /// Append several events as one unit, then publish them in order.
    #[instrument(
        skip(self, events),
        fields(workspace_id = %self.context.workspace_id, event_count = events.len()),
        err
    )]
    pub async fn execute_batch(&self, events: Vec<DomainEvent>) -> Result<PublishReceipt, PublishError> {
        if events.is_empty() {
            return Err(PublishError::EmptyBatch);
        }
        let events = self.prepare(events).await?;
        let committed = self.append(events).await?;
        self.publish(committed).await
    }

    /// Record a follow-up of `parent`: same correlation, caused by `parent`.
    pub async fn react(
        &self,
        parent: &DomainEvent,
        aggregate_id: AggregateId,
        event_type: &str,
        payload: JsonValue,
    ) -> Result<PublishReceipt, PublishError> {
        let event = DomainEvent::caused_by(parent, aggregate_id, event_type, payload);
        self.execute(event).await
    }

    /// Typed [`PublishEvent::react`].
    pub async fn react_with<E: EventFamily>(
        &self,
        parent: &DomainEvent,
        aggregate_id: AggregateId,
        variant: E,
    ) -> Result<PublishReceipt, PublishError> {
        let event = variant.into_caused_by(parent, aggregate_id)?;
        self.execute(event).await
    }

    /// Record a new root event from a typed variant.
    pub async fn record<E: EventFamily>(
        &self,
        aggregate_id: AggregateId,
        variant: E,
    ) -> Result<PublishReceipt, PublishError> {
        let event = variant.into_root(self.context.workspace_id.clone(), aggregate_id)?;
        self.execute(event).await
    }

    /// Pre-append checks over the whole batch. A follow-up may name a parent
    /// appearing earlier in the same batch.
    async fn prepare(&self, events: Vec<DomainEvent>) -> Result<Vec<DomainEvent>, PublishError> {
        let mut prepared: Vec<DomainEvent> = Vec::with_capacity(events.len());
        for event in events {
            let event = self.check(event)?;
            if let Some(causation_id) = event.causation_id() {
                self.check_parent(&event, causation_id, &prepared).await?;
            }
            prepared.push(event);
        }
        Ok(prepared)
    }

    /// Checks on a single event; also stamps the session actor onto anonymous
    /// events.
    ///
    /// Permissions gate only root events. Follow-ups are the system reacting
    /// to something that was already allowed, which `check_parent` verifies.
    fn check(&self, event: DomainEvent) -> Result<DomainEvent, PublishError> {
        if event.workspace_id() != &self.context.workspace_id {
            return Err(PublishError::WorkspaceMismatch {
                event_id: event.event_id(),
                runtime_workspace: self.context.workspace_id.clone(),
                event_workspace: event.workspace_id().clone(),
            });
        }
        if event.is_root() && !self.context.permissions.can_write {
            return Err(PublishError::Forbidden {
                workspace_id: self.context.workspace_id.clone(),
                role: self.context.role,
            });
        }
        let anonymous = event.actor().is_none();
        Ok(match &self.context.actor {
            Some(actor) if anonymous => event.with_actor(actor.clone()),
            _ => event,
        })
    }

    async fn check_parent(
        &self,
        event: &DomainEvent,
        causation_id: EventId,
        batch: &[DomainEvent],
    ) -> Result<(), PublishError> {
        let correlation_id = event.correlation_id();
        let known = match batch.iter().find(|e| e.event_id() == causation_id) {
            Some(parent) => parent.correlation_id() == correlation_id,
            None => {
                let filter = EventFilter::new()
                    .workspace(self.context.workspace_id.clone())
                    .causality(correlation_id);
                self.store
                    .query(&filter)
                    .await
                    .map_err(PublishError::ParentLookup)?
                    .iter()
                    .any(|e| e.event_id() == causation_id && e.correlation_id() == correlation_id)
            }
        };

        if known {
            Ok(())
        } else {
            Err(PublishError::UnknownParent {
                event_id: event.event_id(),
                causation_id,
            })
        }
    }

    async fn append(&self, events: Vec<DomainEvent>) -> Result<Committed, PublishError> {
        match events.as_slice() {
            [event] => self.store.append(event.clone()).await?,
            _ => self.store.append_batch(events.clone()).await?,
        }
        debug!(
            workspace_id = %self.context.workspace_id,
            event_count = events.len(),
            "events appended"
        );
        Ok(Committed { events })
    }

    async fn publish(&self, committed: Committed) -> Result<PublishReceipt, PublishError> {
        let mut dispatch = DispatchReport::default();
        for event in &committed.events {
            let report = self.bus.publish(event.clone()).await?;
            dispatch.merge(report);
        }
        debug!(
            workspace_id = %self.context.workspace_id,
            dispatched = dispatch.dispatched.len(),
            failures = dispatch.failures.len(),
            deferred = dispatch.deferred,
            "events published"
        );
        Ok(PublishReceipt {
            events: committed.events,
            dispatch,
        })
    }
}

impl std::fmt::Debug for PublishEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishEvent")
            .field("workspace_id", &self.context.workspace_id)
            .field("role", &self.context.role)
            .finish()
    }
}
