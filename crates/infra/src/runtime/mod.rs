//! Per-workspace runtime: access context, private bus, shared store handle.

mod context;
mod factory;
mod history;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use qcflow_core::{UserId, WorkspaceId};
use qcflow_events::{
    DomainEvent, EventBus, EventBusExt, EventFamily, EventHandler, HandlerResult, Subscription,
    WorkspaceEventBus,
};

use crate::event_store::EventStore;
use crate::publish_event::PublishEvent;

pub use context::{Workspace, WorkspaceContext, WorkspacePermissions, WorkspaceRole};
pub use factory::WorkspaceRuntimeFactory;
pub use history::WorkspaceHistory;

/// Infrastructure bundle for one workspace.
///
/// The bus is private: consumers subscribe through the runtime and write
/// through [`WorkspaceRuntime::publisher`]. Two runtimes never share a bus.
pub struct WorkspaceRuntime {
    context: Arc<WorkspaceContext>,
    bus: Arc<WorkspaceEventBus>,
    store: Arc<dyn EventStore>,
    publisher: PublishEvent,
}

impl WorkspaceRuntime {
    pub fn new(workspace: &Workspace, actor: Option<UserId>, store: Arc<dyn EventStore>) -> Self {
        let context = Arc::new(WorkspaceContext::new(workspace, actor));
        let bus = Arc::new(WorkspaceEventBus::new(workspace.id.clone()));
        let publisher = PublishEvent::new(context.clone(), store.clone(), bus.clone());

        info!(
            workspace_id = %workspace.id,
            role = %workspace.role,
            "workspace runtime created"
        );

        Self {
            context,
            bus,
            store,
            publisher,
        }
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.context.workspace_id
    }

    pub fn context(&self) -> &WorkspaceContext {
        &self.context
    }

    /// The write path for use cases and reacting handlers.
    pub fn publisher(&self) -> PublishEvent {
        self.publisher.clone()
    }

    /// Read-only queries scoped to this workspace.
    pub fn history(&self) -> WorkspaceHistory {
        WorkspaceHistory::new(self.context.workspace_id.clone(), self.store.clone())
    }

    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        self.bus.subscribe(event_type, handler)
    }

    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Subscription {
        self.bus.subscribe_all(handler)
    }

    pub fn subscribe_family<E, F, Fut>(&self, name: &str, f: F) -> Subscription
    where
        E: EventFamily,
        F: Fn(DomainEvent, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.bus.subscribe_family::<E, F, Fut>(name, f)
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Drop every subscription. The durable log is untouched.
    pub fn shutdown(&self) {
        self.bus.clear();
    }
}

impl Drop for WorkspaceRuntime {
    fn drop(&mut self) {
        // Handlers often hold a publisher, which holds the bus.
        self.bus.clear();
    }
}

impl std::fmt::Debug for WorkspaceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRuntime")
            .field("context", &self.context)
            .field("subscribers", &self.bus.subscriber_count())
            .finish()
    }
}
