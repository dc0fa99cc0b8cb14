//! Domain events, causality tracking and per-workspace dispatch.
//!
//! This crate holds mechanics only: it never touches storage. Durable
//! appends live in `qcflow-infra`.

pub mod bus;
pub mod catalog;
pub mod causality;
pub mod event;
pub mod family;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{BusError, DispatchReport, EventBus, EventBusExt, HandlerFailure, Subscription, SubscriptionId};
pub use catalog::TaskEvent;
pub use causality::{CausalLink, CausalTree, CausalityViolation, causal_tree, verify_chain};
pub use event::{Clock, DomainEvent, EventMetadata, MonotonicClock, SystemClock};
pub use family::{DecodeError, EventFamily};
pub use handler::{EventHandler, HandlerError, HandlerResult, family_handler_fn, handler_fn};
pub use in_memory_bus::WorkspaceEventBus;
