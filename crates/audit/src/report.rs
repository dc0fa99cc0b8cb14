use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::rules::{Rule, Violation};

/// Result of one audit run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub files_scanned: usize,
    pub violations: Vec<Violation>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn counts_by_rule(&self) -> BTreeMap<Rule, usize> {
        let mut counts = BTreeMap::new();
        for violation in &self.violations {
            *counts.entry(violation.rule).or_insert(0) += 1;
        }
        counts
    }

    /// `file:line:col [rule] message` per violation, then a summary line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for v in &self.violations {
            let _ = writeln!(out, "{}:{}:{} [{}] {}", v.file, v.line, v.column, v.rule, v.message);
        }
        if self.is_clean() {
            let _ = writeln!(out, "ok: {} files, no protocol violations", self.files_scanned);
        } else {
            let breakdown: Vec<String> = self
                .counts_by_rule()
                .iter()
                .map(|(rule, n)| format!("{rule}: {n}"))
                .collect();
            let _ = writeln!(
                out,
                "{} violation(s) in {} files ({})",
                self.violations.len(),
                self.files_scanned,
                breakdown.join(", ")
            );
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_report_uses_kebab_case_rules() {
        let report = AuditReport {
            files_scanned: 3,
            violations: vec![Violation {
                file: "crates/ui/src/board.rs".to_string(),
                line: 4,
                column: 5,
                rule: Rule::PresentationImport,
                message: "nope".to_string(),
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["violations"][0]["rule"], "presentation-import");
        assert_eq!(json["files_scanned"], 3);
        assert!(report.to_text().contains("crates/ui/src/board.rs:4:5 [presentation-import] nope"));
    }
}
