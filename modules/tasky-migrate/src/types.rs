//! Core types shared by the pipeline stages.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pipeline stages, in execution order. Used to label log events and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ValidateConfig,
    WaitAdminConnection,
    EnsureDatabase,
    WaitTargetConnection,
    EnsureRole,
    EnsureLedgerTable,
    LoadLedger,
    ScanPatches,
    ApplyPending,
    GrantPrivileges,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ValidateConfig => "validate_config",
            Stage::WaitAdminConnection => "wait_admin_connection",
            Stage::EnsureDatabase => "ensure_database",
            Stage::WaitTargetConnection => "wait_target_connection",
            Stage::EnsureRole => "ensure_role",
            Stage::EnsureLedgerTable => "ensure_ledger_table",
            Stage::LoadLedger => "load_ledger",
            Stage::ScanPatches => "scan_patches",
            Stage::ApplyPending => "apply_pending",
            Stage::GrantPrivileges => "grant_privileges",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One eligible `.sql` file from the patch directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PatchFile {
    pub filename: String,
    pub path: PathBuf,
}

/// A row of the `migrations` ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerRecord {
    pub filename: String,
    pub created: DateTime<Utc>,
}

/// What happened to a single patch during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    SkippedAlreadyApplied,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchResult {
    pub filename: String,
    #[serde(flatten)]
    pub outcome: PatchOutcome,
}

/// Per-patch outcomes of one run, in the order the patches were considered.
/// Built fresh each run; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationRunReport {
    pub patches: Vec<PatchResult>,
}

impl MigrationRunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filename: impl Into<String>, outcome: PatchOutcome) {
        self.patches.push(PatchResult {
            filename: filename.into(),
            outcome,
        });
    }

    /// Filenames applied during this run, in application order.
    pub fn applied(&self) -> Vec<&str> {
        self.filenames_where(|o| matches!(o, PatchOutcome::Applied))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.filenames_where(|o| matches!(o, PatchOutcome::SkippedAlreadyApplied))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.filenames_where(|o| matches!(o, PatchOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.patches
            .iter()
            .any(|p| matches!(p.outcome, PatchOutcome::Failed { .. }))
    }

    pub fn outcome_of(&self, filename: &str) -> Option<&PatchOutcome> {
        self.patches
            .iter()
            .find(|p| p.filename == filename)
            .map(|p| &p.outcome)
    }

    fn filenames_where(&self, pred: impl Fn(&PatchOutcome) -> bool) -> Vec<&str> {
        self.patches
            .iter()
            .filter(|p| pred(&p.outcome))
            .map(|p| p.filename.as_str())
            .collect()
    }
}

impl fmt::Display for MigrationRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} skipped, {} failed",
            self.applied().len(),
            self.skipped().len(),
            self.failed().len()
        )
    }
}

/// Read-only view of the ledger against the patch directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub applied: Vec<LedgerRecord>,
    pub pending: Vec<PatchFile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_partitions_outcomes_in_order() {
        let mut report = MigrationRunReport::new();
        report.push("0001_a.sql", PatchOutcome::SkippedAlreadyApplied);
        report.push("0002_b.sql", PatchOutcome::Applied);
        report.push(
            "0003_c.sql",
            PatchOutcome::Failed {
                reason: "syntax error".into(),
            },
        );
        report.push("0004_d.sql", PatchOutcome::Applied);

        assert_eq!(report.applied(), vec!["0002_b.sql", "0004_d.sql"]);
        assert_eq!(report.skipped(), vec!["0001_a.sql"]);
        assert_eq!(report.failed(), vec!["0003_c.sql"]);
        assert!(report.has_failures());
        assert_eq!(report.to_string(), "2 applied, 1 skipped, 1 failed");
    }

    #[test]
    fn report_serializes_outcome_tag_inline() {
        let mut report = MigrationRunReport::new();
        report.push(
            "0002_b.sql",
            PatchOutcome::Failed {
                reason: "boom".into(),
            },
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "patches": [
                    {"filename": "0002_b.sql", "outcome": "failed", "reason": "boom"}
                ]
            })
        );
    }

    #[test]
    fn stage_names_are_snake_case() {
        assert_eq!(Stage::EnsureLedgerTable.to_string(), "ensure_ledger_table");
        assert_eq!(
            serde_json::to_value(Stage::WaitAdminConnection).unwrap(),
            serde_json::json!("wait_admin_connection")
        );
    }
}
