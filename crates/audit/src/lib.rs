//! Static conformance check for the event write protocol.
//!
//! Scans Rust sources and reports modules that bypass the publish use case,
//! race an append against a publish, or build follow-up events without
//! linking them to the event being handled.

pub mod config;
pub mod paths;
pub mod report;
pub mod rules;

use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use thiserror::Error;
use tracing::debug;

pub use config::AuditConfig;
pub use paths::PathMatcher;
pub use report::AuditReport;
pub use rules::{FileRole, Guards, Rule, Violation};

/// Operational failure: the audit could not produce a verdict.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid config {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("invalid path pattern {0}")]
    Pattern(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("directory walk failed: {0}")]
    Walk(String),

    #[error("no Rust sources found under {0}")]
    NoSources(PathBuf),
}

/// Compiled configuration bound to one root directory.
#[derive(Debug, Clone)]
pub struct Auditor {
    root: PathBuf,
    guards: Guards,
    writers: PathMatcher,
    presentation: PathMatcher,
    handlers: PathMatcher,
    exclude: PathMatcher,
}

impl Auditor {
    pub fn new(root: impl Into<PathBuf>, config: &AuditConfig) -> Result<Self, AuditError> {
        let root = root.into();
        Ok(Self {
            guards: Guards::new(config.guarded_types.iter().cloned(), config.guarded_crates.iter().cloned()),
            writers: PathMatcher::new(&root, &config.writer_allowlist)?,
            presentation: PathMatcher::new(&root, &config.presentation)?,
            handlers: PathMatcher::new(&root, &config.handlers)?,
            exclude: PathMatcher::new(&root, &config.exclude)?,
            root,
        })
    }

    pub fn role_of(&self, relative: &str) -> FileRole {
        FileRole {
            presentation: self.presentation.matches(relative),
            allowed_writer: self.writers.matches(relative),
            handler: self.handlers.matches(relative),
        }
    }

    /// Check one source text; `relative` decides which rules apply.
    pub fn check_source(&self, relative: &str, source: &str) -> Result<Vec<Violation>, AuditError> {
        let syntax = syn::parse_file(source).map_err(|e| AuditError::Parse {
            path: relative.to_string(),
            message: e.to_string(),
        })?;
        Ok(rules::check_file(relative, &syntax, self.role_of(relative), &self.guards))
    }

    /// Every `.rs` file under the root, honoring `.gitignore` and `exclude`.
    pub fn sources(&self) -> Result<Vec<PathBuf>, AuditError> {
        let mut files = Vec::new();
        for entry in WalkBuilder::new(&self.root).build() {
            let entry = entry.map_err(|e| AuditError::Walk(e.to_string()))?;
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("rs") {
                continue;
            }
            if self.exclude.matches(&paths::relative_path(&self.root, path)) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        Ok(files)
    }

    pub fn run(&self) -> Result<AuditReport, AuditError> {
        let files = self.sources()?;
        if files.is_empty() {
            return Err(AuditError::NoSources(self.root.clone()));
        }

        let mut report = AuditReport::default();
        for path in &files {
            let source = fs::read_to_string(path).map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;
            let relative = paths::relative_path(&self.root, path);
            let violations = self.check_source(&relative, &source)?;
            debug!(file = %relative, violations = violations.len(), "audited");
            report.violations.extend(violations);
            report.files_scanned += 1;
        }
        Ok(report)
    }
}

/// Load the config for `root` and audit it.
pub fn audit(root: &Path, config_path: Option<&Path>) -> Result<AuditReport, AuditError> {
    let (config, origin) = AuditConfig::load(root, config_path)?;
    if let Some(origin) = &origin {
        debug!(config = %origin.display(), "loaded audit config");
    }
    Auditor::new(root, &config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn workspace_scan_applies_roles_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "crates/infra/src/publish_event.rs",
            "use crate::EventStore;\nasync fn go(s: &dyn EventStore, e: E) { s.append(e).await; }\n",
        );
        write(
            root,
            "crates/app/src/tasks.rs",
            "use qcflow_infra::EventStore;\nasync fn go(s: &dyn EventStore, e: E) { s.append(e).await; }\n",
        );
        write(root, "crates/ui/src/board.rs", "use qcflow_events::WorkspaceEventBus;\n");
        write(root, "target/debug/build/gen.rs", "use qcflow_events::WorkspaceEventBus;\n");

        let report = audit(root, None).unwrap();
        assert_eq!(report.files_scanned, 3);
        let found: Vec<(String, Rule)> = report
            .violations
            .iter()
            .map(|v| (v.file.clone(), v.rule))
            .collect();
        assert_eq!(
            found,
            vec![
                ("crates/app/src/tasks.rs".to_string(), Rule::UnauthorizedWriter),
                ("crates/ui/src/board.rs".to_string(), Rule::PresentationImport),
            ]
        );
    }

    #[test]
    fn out_of_band_appends_without_named_types_are_caught() {
        let dir = tempfile::tempdir().unwrap();
        let auditor = Auditor::new(dir.path(), &AuditConfig::default()).unwrap();

        let through_factory = "async fn go(f: &Factory, e: E) { f.store().append(e).await; }";
        let glob_import = "use qcflow_infra::*;\nasync fn go(s: &S, e: E) { s.append(e).await; }";
        for source in [through_factory, glob_import] {
            let violations = auditor.check_source("crates/app/src/tasks.rs", source).unwrap();
            let rules: Vec<Rule> = violations.iter().map(|v| v.rule).collect();
            assert_eq!(rules, vec![Rule::UnauthorizedWriter], "{source}");
        }
    }

    #[test]
    fn config_file_at_root_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "web/view.rs", "use qcflow_infra::EventStore;\n");
        write(root, config::CONFIG_FILE, "presentation = [\"web/**\"]\n");

        let report = audit(root, None).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].rule, Rule::PresentationImport);
    }

    #[test]
    fn empty_tree_and_bad_syntax_are_operational_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(audit(dir.path(), None), Err(AuditError::NoSources(_))));

        write(dir.path(), "src/lib.rs", "fn broken( {");
        assert!(matches!(audit(dir.path(), None), Err(AuditError::Parse { .. })));
    }
}
