//! Infrastructure layer: event storage, the publish use case, and the
//! per-workspace runtime that ties store, bus and access context together.

pub mod config;
pub mod event_store;
pub mod publish_event;
pub mod runtime;


pub use config::{ConfigError, RuntimeConfig, StoreConfig};
pub use event_store::{EventFilter, EventStore, EventStoreError, InMemoryEventStore, SqliteEventStore};
pub use publish_event::{PublishError, PublishEvent, PublishReceipt};
pub use runtime::{
    Workspace, WorkspaceContext, WorkspaceHistory, WorkspacePermissions, WorkspaceRole,
    WorkspaceRuntime, WorkspaceRuntimeFactory,
};
