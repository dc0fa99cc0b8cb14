//! Runtime configuration from the environment.
//!
//! | variable              | meaning                                   | default  |
//! |-----------------------|-------------------------------------------|----------|
//! | `QCFLOW_STORE`        | `memory` or `sqlite://path/to/events.db`  | `memory` |
//! | `QCFLOW_SESSION_USER` | actor stamped onto originated events      | unset    |
//!
//! Log output is configured by `qcflow-observability` (`RUST_LOG`,
//! `QCFLOW_LOG_FORMAT`).

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use qcflow_core::UserId;

use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, SqliteEventStore};
use crate::runtime::WorkspaceRuntimeFactory;

pub const STORE_VAR: &str = "QCFLOW_STORE";
pub const SESSION_USER_VAR: &str = "QCFLOW_SESSION_USER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("could not open event store: {0}")]
    Store(#[from] EventStoreError),
}

/// Which event store backend to use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreConfig {
    #[default]
    Memory,
    /// SQLx connection URL, e.g. `sqlite://data/events.db` or `sqlite::memory:`.
    Sqlite { url: String },
}

impl StoreConfig {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("memory") {
            return Ok(StoreConfig::Memory);
        }
        if raw.starts_with("sqlite:") {
            return Ok(StoreConfig::Sqlite { url: raw.to_string() });
        }
        Err(ConfigError::InvalidValue {
            key: STORE_VAR,
            message: format!("expected 'memory' or a sqlite URL, got '{raw}'"),
        })
    }

    pub async fn connect(&self) -> Result<Arc<dyn EventStore>, ConfigError> {
        let store: Arc<dyn EventStore> = match self {
            StoreConfig::Memory => Arc::new(InMemoryEventStore::new()),
            StoreConfig::Sqlite { url } => Arc::new(SqliteEventStore::connect(url).await?),
        };
        Ok(store)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub store: StoreConfig,
    pub session_user: Option<UserId>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimeConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store = match lookup(STORE_VAR) {
            Some(raw) => StoreConfig::parse(&raw)?,
            None => StoreConfig::default(),
        };

        let session_user = match lookup(SESSION_USER_VAR) {
            Some(raw) if !raw.trim().is_empty() => {
                Some(UserId::new(raw.trim()).map_err(|e| ConfigError::InvalidValue {
                    key: SESSION_USER_VAR,
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };

        Ok(Self { store, session_user })
    }

    /// Open the configured store and wrap it in a runtime registry.
    pub async fn build_factory(&self) -> Result<WorkspaceRuntimeFactory, ConfigError> {
        let store = self.store.connect().await?;
        info!(store = ?self.store, "event store ready");

        let factory = WorkspaceRuntimeFactory::new(store);
        Ok(match &self.session_user {
            Some(user) => factory.with_session_user(user.clone()),
            None => factory,
        })
    }
}
