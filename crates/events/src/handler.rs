use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::family::{DecodeError, EventFamily};
use crate::DomainEvent;

/// Failure reported by a single handler.
///
/// Handler failures are local: the bus records them and keeps delivering to
/// sibling handlers. They never undo the append that preceded the publish.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Reacts to published events.
///
/// Handlers used for projections only read. Handlers that produce follow-up
/// events must go through the publish use case, which links the follow-up to
/// the event being handled.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and dispatch reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerResult;
}

/// Closure-backed handler, see [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerResult {
        (self.f)(event.clone()).await
    }
}

/// Build a handler from an async closure. The closure gets its own copy of
/// the event.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

/// Handler that decodes into an [`EventFamily`] before calling the closure.
pub struct FamilyHandler<E, F> {
    name: String,
    f: F,
    _family: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, F, Fut> EventHandler for FamilyHandler<E, F>
where
    E: EventFamily,
    F: Fn(DomainEvent, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> HandlerResult {
        let decoded = E::decode(event)?;
        (self.f)(event.clone(), decoded).await
    }
}

/// Build a typed handler: the raw event is decoded into `E` first and decode
/// failures are reported as handler failures.
pub fn family_handler_fn<E, F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    E: EventFamily,
    F: Fn(DomainEvent, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FamilyHandler {
        name: name.into(),
        f,
        _family: PhantomData,
    })
}
