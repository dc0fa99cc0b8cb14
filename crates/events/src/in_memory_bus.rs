//! In-process bus serving one workspace.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use qcflow_core::WorkspaceId;

use crate::bus::{BusError, DispatchReport, EventBus, HandlerFailure, Subscription, SubscriptionId};
use crate::handler::{EventHandler, HandlerError};
use crate::DomainEvent;

type Entry = (SubscriptionId, Arc<dyn EventHandler>);

#[derive(Default)]
struct Registry {
    by_type: HashMap<String, Vec<Entry>>,
    all: Vec<Entry>,
}

impl Registry {
    fn remove(&mut self, id: SubscriptionId) {
        for entries in self.by_type.values_mut() {
            entries.retain(|(sid, _)| *sid != id);
        }
        self.by_type.retain(|_, entries| !entries.is_empty());
        self.all.retain(|(sid, _)| *sid != id);
    }

    fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum::<usize>() + self.all.len()
    }
}

/// In-process pub/sub bus for a single workspace.
///
/// - Cooperative dispatch: one dispatcher drains the queue at a time; each
///   event's handlers run to completion before the next event is delivered.
/// - Reentrant: a handler may publish (through the publish use case); the
///   new event is queued and delivered right after the current one.
/// - Handler failures and panics are isolated per handler.
pub struct WorkspaceEventBus {
    workspace_id: WorkspaceId,
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<DomainEvent>>,
    draining: AtomicBool,
}

impl WorkspaceEventBus {
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: AtomicU64::new(1),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    fn register(&self, event_type: Option<&str>, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            match event_type {
                Some(event_type) => registry
                    .by_type
                    .entry(event_type.to_string())
                    .or_default()
                    .push((id, handler)),
                None => registry.all.push((id, handler)),
            }
        }

        let registry: Weak<RwLock<Registry>> = Arc::downgrade(&self.registry);
        Subscription::new(id, move || {
            if let Some(registry) = registry.upgrade() {
                registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
            }
        })
    }

    /// Snapshot of the handlers for one event: type handlers first, then
    /// catch-all handlers.
    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .by_type
            .get(event_type)
            .into_iter()
            .flatten()
            .chain(registry.all.iter())
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    fn pop(&self) -> Option<DomainEvent> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    async fn deliver(&self, event: &DomainEvent, report: &mut DispatchReport) {
        let handlers = self.handlers_for(event.event_type());
        debug!(
            workspace_id = %self.workspace_id,
            event_id = %event.event_id(),
            event_type = event.event_type(),
            handlers = handlers.len(),
            "dispatching event"
        );

        for handler in handlers {
            report.invocations += 1;
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(panic) => HandlerError::Panicked(panic_message(panic.as_ref())),
            };

            warn!(
                workspace_id = %self.workspace_id,
                event_id = %event.event_id(),
                event_type = event.event_type(),
                handler = handler.name(),
                error = %error,
                "event handler failed"
            );
            report.failures.push(HandlerFailure {
                handler: handler.name().to_string(),
                event_id: event.event_id(),
                event_type: event.event_type().to_string(),
                error: error.to_string(),
            });
        }

        report.dispatched.push(event.event_id());
    }
}

/// Resets the draining flag even if the publishing future is dropped mid-way.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl EventBus for WorkspaceEventBus {
    fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        self.register(Some(event_type), handler)
    }

    fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        self.register(None, handler)
    }

    async fn publish(&self, event: DomainEvent) -> Result<DispatchReport, BusError> {
        if event.workspace_id() != &self.workspace_id {
            warn!(
                bus_workspace = %self.workspace_id,
                event_workspace = %event.workspace_id(),
                event_id = %event.event_id(),
                "refusing to publish event from another workspace"
            );
            return Err(BusError::WorkspaceMismatch {
                event_id: event.event_id(),
                bus_workspace: self.workspace_id.clone(),
                event_workspace: event.workspace_id().clone(),
            });
        }

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);

        let mut report = DispatchReport::default();
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another dispatcher owns the queue and will deliver our event.
                report.deferred = report.dispatched.is_empty();
                return Ok(report);
            }

            {
                let _guard = DrainGuard(&self.draining);
                while let Some(next) = self.pop() {
                    self.deliver(&next, &mut report).await;
                }
            }

            // An event pushed between the last pop and the guard release would
            // otherwise sit in the queue with nobody draining it.
            if self.queue_is_empty() {
                return Ok(report);
            }
        }
    }

    fn clear(&self) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        *registry = Registry::default();
    }

    fn subscriber_count(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for WorkspaceEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceEventBus")
            .field("workspace_id", &self.workspace_id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
