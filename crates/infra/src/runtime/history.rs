use std::sync::Arc;

use chrono::{DateTime, Utc};

use qcflow_core::{AggregateId, EventId, WorkspaceId};
use qcflow_events::{CausalTree, CausalityViolation, DomainEvent, causal_tree, verify_chain};

use crate::event_store::{EventFilter, EventStore, EventStoreError};

/// Read side of one workspace's log.
///
/// Every query is pinned to the workspace, so a projection built from it
/// cannot see another workspace's events.
#[derive(Clone)]
pub struct WorkspaceHistory {
    workspace_id: WorkspaceId,
    store: Arc<dyn EventStore>,
}

impl WorkspaceHistory {
    pub(crate) fn new(workspace_id: WorkspaceId, store: Arc<dyn EventStore>) -> Self {
        Self { workspace_id, store }
    }

    fn filter(&self) -> EventFilter {
        EventFilter::new().workspace(self.workspace_id.clone())
    }

    pub async fn all(&self) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.store.query(&self.filter()).await
    }

    pub async fn for_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.store.query(&self.filter().aggregate(aggregate_id.clone())).await
    }

    pub async fn by_type(&self, event_type: &str) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.store.query(&self.filter().event_type(event_type)).await
    }

    pub async fn by_causality(&self, id: EventId) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.store.query(&self.filter().causality(id)).await
    }

    pub async fn since(&self, since: DateTime<Utc>) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.store.query(&self.filter().since(since)).await
    }

    pub async fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.store.query(&self.filter().since(start).until(end)).await
    }

    /// The transaction rooted at `root`, if that event is in this workspace.
    pub async fn transaction(&self, root: EventId) -> Result<Option<CausalTree>, EventStoreError> {
        let events = self.by_causality(root).await?;
        Ok(causal_tree(&events, root))
    }

    /// Check correlation/causation links across the whole workspace log.
    pub async fn verify(&self) -> Result<Vec<CausalityViolation>, EventStoreError> {
        let events = self.all().await?;
        Ok(verify_chain(&events))
    }
}

impl std::fmt::Debug for WorkspaceHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceHistory")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}
