//! Append-only event store boundary.
//!
//! The trait makes no storage assumptions: the in-memory log (dev/tests) and
//! the SQLite document store are interchangeable behind it.

pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventFilter, EventStore, EventStoreError};
pub use sqlite::SqliteEventStore;
