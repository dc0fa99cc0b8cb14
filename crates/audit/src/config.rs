//! `qcflow-audit.toml`.
//!
//! Every key is optional; missing keys keep the defaults, which describe
//! this workspace's layout. Unknown keys are rejected.
//!
//! ```toml
//! guarded_types = ["EventStore", "EventBus"]
//! guarded_crates = ["qcflow_infra"]
//! writer_allowlist = ["crates/infra/src/publish_event.rs"]
//! presentation = ["crates/ui/**"]
//! handlers = ["**/handlers/**"]
//! exclude = ["target/**"]
//! ```
//!
//! Path entries are gitignore-style globs relative to the audited root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::AuditError;

pub const CONFIG_FILE: &str = "qcflow-audit.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// Type names whose import gives a module a handle on the log or the bus.
    pub guarded_types: Vec<String>,
    /// Crates whose glob imports (`use krate::*`) count as guarded references.
    pub guarded_crates: Vec<String>,
    /// Modules allowed to call `append` / `append_batch` / `publish`.
    pub writer_allowlist: Vec<String>,
    /// Presentation-layer modules; they must not import guarded types.
    pub presentation: Vec<String>,
    /// Event handler modules: allowed to write, checked for propagation.
    pub handlers: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            guarded_types: [
                "EventStore",
                "InMemoryEventStore",
                "SqliteEventStore",
                "EventBus",
                "WorkspaceEventBus",
            ]
            .map(String::from)
            .to_vec(),
            guarded_crates: ["qcflow_infra", "qcflow_events"].map(String::from).to_vec(),
            writer_allowlist: [
                "crates/infra/src/publish_event.rs",
                "crates/infra/src/event_store/**",
                "crates/events/src/**",
            ]
            .map(String::from)
            .to_vec(),
            presentation: ["crates/ui/**", "crates/app/src/views/**", "crates/app/src/components/**"]
                .map(String::from)
                .to_vec(),
            handlers: ["**/handlers/**", "*_handler.rs"].map(String::from).to_vec(),
            exclude: ["target/**"].map(String::from).to_vec(),
        }
    }
}

impl AuditConfig {
    pub fn from_toml(raw: &str, origin: &Path) -> Result<Self, AuditError> {
        toml::from_str(raw).map_err(|e| AuditError::Config {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load `explicit` if given (it must exist), else `<root>/qcflow-audit.toml`
    /// when present, else the defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), AuditError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = root.join(CONFIG_FILE);
                if !candidate.is_file() {
                    return Ok((Self::default(), None));
                }
                candidate
            }
        };

        let raw = fs::read_to_string(&path).map_err(|e| AuditError::Config {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok((Self::from_toml(&raw, &path)?, Some(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = AuditConfig::from_toml(r#"presentation = ["web/**"]"#, Path::new("x.toml")).unwrap();
        assert_eq!(config.presentation, vec!["web/**".to_string()]);
        assert_eq!(config.guarded_types, AuditConfig::default().guarded_types);
    }

    #[test]
    fn unknown_keys_are_config_errors() {
        let err = AuditConfig::from_toml("guarded = []", Path::new("x.toml")).unwrap_err();
        assert!(matches!(err, AuditError::Config { .. }));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AuditConfig::load(dir.path(), Some(&missing)).is_err());

        let (config, origin) = AuditConfig::load(dir.path(), None).unwrap();
        assert_eq!(config, AuditConfig::default());
        assert!(origin.is_none());
    }
}
