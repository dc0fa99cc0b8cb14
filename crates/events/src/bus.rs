//! Per-workspace publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes **already durable** events to interested handlers.
//! It never stores anything: the event store is the source of truth and
//! the publish use case in `qcflow-infra` only publishes after a
//! successful append.
//!
//! ```text
//! use case → EventStore::append → EventBus::publish → handlers
//!                                                      ├─ projections
//!                                                      ├─ audit log
//!                                                      └─ reactions (follow-up use cases)
//! ```
//!
//! ## Scope
//!
//! One bus instance serves exactly one workspace. Publishing an event that
//! belongs to another workspace is rejected before any handler runs.
//!
//! ## Failure model
//!
//! - A handler returning an error (or panicking) does not stop delivery to
//!   the other handlers of the same publish; failures are collected in the
//!   [`DispatchReport`].
//! - Publishing with zero subscribers is not an error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use qcflow_core::{EventId, WorkspaceId};

use crate::family::EventFamily;
use crate::handler::{EventHandler, HandlerResult, family_handler_fn};
use crate::DomainEvent;

/// Identifier of one registration on a bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionId(pub(crate) u64);

type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Handle returned by `subscribe*`.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    ids: Vec<SubscriptionId>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            ids: vec![id],
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Merge several registrations into one handle that removes them all.
    pub fn combine(subscriptions: Vec<Subscription>) -> Self {
        let ids = subscriptions.iter().flat_map(|s| s.ids.clone()).collect();
        Self {
            ids,
            unsubscribe: Some(Box::new(move || {
                for subscription in subscriptions {
                    subscription.unsubscribe();
                }
            })),
        }
    }

    pub fn ids(&self) -> &[SubscriptionId] {
        &self.ids
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("ids", &self.ids).finish()
    }
}

/// One handler failure during a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerFailure {
    pub handler: String,
    pub event_id: EventId,
    pub event_type: String,
    pub error: String,
}

/// What happened during one `publish` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Events delivered by this call, in delivery order. Besides the
    /// published event this can include events queued by handlers meanwhile.
    pub dispatched: Vec<EventId>,
    /// Total handler invocations.
    pub invocations: usize,
    pub failures: Vec<HandlerFailure>,
    /// The event was queued behind a dispatch already running on this bus
    /// and will be delivered by that dispatcher.
    pub deferred: bool,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: DispatchReport) {
        self.dispatched.extend(other.dispatched);
        self.invocations += other.invocations;
        self.failures.extend(other.failures);
        self.deferred |= other.deferred;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event {event_id} belongs to workspace '{event_workspace}', bus serves '{bus_workspace}'")]
    WorkspaceMismatch {
        event_id: EventId,
        bus_workspace: WorkspaceId,
        event_workspace: WorkspaceId,
    },
}

/// Workspace-scoped event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// The workspace this bus serves.
    fn workspace_id(&self) -> &WorkspaceId;

    /// Register a handler for one event type.
    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Subscription;

    /// Register a handler for every event published on this bus.
    fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Subscription;

    /// Deliver an already appended event to the current subscribers.
    async fn publish(&self, event: DomainEvent) -> Result<DispatchReport, BusError>;

    /// Drop every subscription (runtime teardown).
    fn clear(&self);

    fn subscriber_count(&self) -> usize;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn workspace_id(&self) -> &WorkspaceId {
        (**self).workspace_id()
    }

    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        (**self).subscribe(event_type, handler)
    }

    fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        (**self).subscribe_all(handler)
    }

    async fn publish(&self, event: DomainEvent) -> Result<DispatchReport, BusError> {
        (**self).publish(event).await
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn subscriber_count(&self) -> usize {
        (**self).subscriber_count()
    }
}

/// Typed subscriptions on top of the string-keyed contract.
pub trait EventBusExt: EventBus {
    /// Subscribe to every type of `E`; the closure receives the decoded variant.
    fn subscribe_family<E, F, Fut>(&self, name: &str, f: F) -> Subscription
    where
        E: EventFamily,
        F: Fn(DomainEvent, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = family_handler_fn::<E, _, _>(name, f);
        let subscriptions = E::event_types()
            .iter()
            .map(|event_type| self.subscribe(event_type, handler.clone()))
            .collect();
        Subscription::combine(subscriptions)
    }
}

impl<B: EventBus + ?Sized> EventBusExt for B {}
