use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use qcflow_core::{UserId, WorkspaceId};

use super::{Workspace, WorkspaceRuntime};
use crate::event_store::EventStore;

/// Registry of live workspace runtimes.
///
/// One instance is owned by the application shell and passed by reference.
/// All runtimes share the same append-only store; each has its own bus.
pub struct WorkspaceRuntimeFactory {
    store: Arc<dyn EventStore>,
    session_user: Option<UserId>,
    runtimes: RwLock<HashMap<WorkspaceId, Arc<WorkspaceRuntime>>>,
}

impl WorkspaceRuntimeFactory {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            session_user: None,
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Actor stamped onto events originated through runtimes of this factory.
    pub fn with_session_user(mut self, user: UserId) -> Self {
        self.session_user = Some(user);
        self
    }

    /// Return the runtime for `workspace.id`, creating it on first use.
    ///
    /// An existing runtime is returned as is, even if `workspace` carries a
    /// different name or role.
    pub fn create_runtime(&self, workspace: &Workspace) -> Arc<WorkspaceRuntime> {
        let mut runtimes = self.runtimes.write().unwrap_or_else(PoisonError::into_inner);
        runtimes
            .entry(workspace.id.clone())
            .or_insert_with(|| {
                Arc::new(WorkspaceRuntime::new(
                    workspace,
                    self.session_user.clone(),
                    self.store.clone(),
                ))
            })
            .clone()
    }

    /// Never constructs.
    pub fn get_runtime(&self, workspace_id: &WorkspaceId) -> Option<Arc<WorkspaceRuntime>> {
        self.runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workspace_id)
            .cloned()
    }

    /// Clear the runtime's subscriptions and forget it. Returns whether a
    /// runtime was registered. Stored events are kept.
    pub fn destroy_runtime(&self, workspace_id: &WorkspaceId) -> bool {
        let removed = self
            .runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workspace_id);

        match removed {
            Some(runtime) => {
                runtime.shutdown();
                info!(workspace_id = %workspace_id, "workspace runtime destroyed");
                true
            }
            None => false,
        }
    }

    pub fn destroy_all(&self) {
        let drained: Vec<_> = self
            .runtimes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (workspace_id, runtime) in drained {
            runtime.shutdown();
            info!(workspace_id = %workspace_id, "workspace runtime destroyed");
        }
    }

    /// Make `workspace` the only live runtime.
    pub fn switch_workspace(&self, workspace: &Workspace) -> Arc<WorkspaceRuntime> {
        let others: Vec<WorkspaceId> = self
            .active_workspaces()
            .into_iter()
            .filter(|id| id != &workspace.id)
            .collect();
        for workspace_id in &others {
            self.destroy_runtime(workspace_id);
        }
        self.create_runtime(workspace)
    }

    /// Ids of the live runtimes, sorted.
    pub fn active_workspaces(&self) -> Vec<WorkspaceId> {
        let mut ids: Vec<WorkspaceId> = self
            .runtimes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for WorkspaceRuntimeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRuntimeFactory")
            .field("session_user", &self.session_user)
            .field("active_workspaces", &self.active_workspaces())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::runtime::WorkspaceRole;
    use qcflow_events::handler_fn;

    fn workspace(id: &str) -> Workspace {
        Workspace::new(WorkspaceId::new(id).unwrap(), format!("Site {id}"), WorkspaceRole::Member)
    }

    fn factory() -> WorkspaceRuntimeFactory {
        WorkspaceRuntimeFactory::new(Arc::new(InMemoryEventStore::new()))
    }

    #[test]
    fn create_is_idempotent_per_id() {
        let factory = factory();
        let first = factory.create_runtime(&workspace("ws-1"));
        let mut renamed = workspace("ws-1");
        renamed.role = WorkspaceRole::Viewer;
        let second = factory.create_runtime(&renamed);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.context().role, WorkspaceRole::Member);
    }

    #[test]
    fn get_never_constructs() {
        let factory = factory();
        assert!(factory.get_runtime(&WorkspaceId::new("ws-1").unwrap()).is_none());
        assert!(factory.active_workspaces().is_empty());
    }

    #[test]
    fn destroy_clears_subscriptions_and_forgets_runtime() {
        let factory = factory();
        let runtime = factory.create_runtime(&workspace("ws-1"));
        let _sub = runtime.subscribe_all(handler_fn("noop", |_| async { Ok(()) }));
        assert_eq!(runtime.subscriber_count(), 1);

        assert!(factory.destroy_runtime(runtime.workspace_id()));
        assert_eq!(runtime.subscriber_count(), 0);
        assert!(factory.get_runtime(runtime.workspace_id()).is_none());
        assert!(!factory.destroy_runtime(runtime.workspace_id()));
    }

    #[test]
    fn switch_keeps_only_the_target() {
        let factory = factory();
        factory.create_runtime(&workspace("ws-1"));
        factory.create_runtime(&workspace("ws-2"));

        let target = factory.switch_workspace(&workspace("ws-3"));
        assert_eq!(target.workspace_id().as_str(), "ws-3");
        assert_eq!(factory.active_workspaces(), vec![WorkspaceId::new("ws-3").unwrap()]);

        factory.destroy_all();
        assert!(factory.active_workspaces().is_empty());
    }
}
