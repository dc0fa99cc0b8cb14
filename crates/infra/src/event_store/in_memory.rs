use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use qcflow_core::EventId;
use qcflow_events::DomainEvent;

use super::r#trait::{EventFilter, EventStore, EventStoreError};

#[derive(Debug, Default)]
struct Log {
    /// Append order. Queries sort a copy by `occurred_at`; the stable sort
    /// keeps append order for equal timestamps.
    events: Vec<DomainEvent>,
    ids: HashSet<EventId>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(PoisonError::into_inner).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: DomainEvent) -> Result<(), EventStoreError> {
        self.append_batch(vec![event]).await
    }

    async fn append_batch(&self, events: Vec<DomainEvent>) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut log = self
            .log
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        // Validate the whole batch before touching the log.
        let mut incoming = HashSet::with_capacity(events.len());
        for event in &events {
            let id = event.event_id();
            if log.ids.contains(&id) || !incoming.insert(id) {
                return Err(EventStoreError::DuplicateEvent(id));
            }
        }

        log.ids.extend(incoming);
        log.events.extend(events);
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError> {
        filter.validate()?;

        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let mut out: Vec<DomainEvent> = log.events.iter().filter(|e| filter.matches(e)).cloned().collect();
        out.sort_by_key(|e| e.occurred_at());
        Ok(out)
    }
}
