//! The JSON document written for every run.

use crate::state::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sportsdb_core::{Direction, MigrationError, MutationSummary, PrerequisiteReport, ValidationReport};
use std::fs;
use std::path::{Path, PathBuf};

/// Overall outcome recorded in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What happened to one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step id.
    pub id: String,
    /// Forward or reverse.
    pub direction: Direction,
    /// Final state reached.
    pub state: RunState,
    /// The ledger already had this step.
    pub skipped: bool,
    /// Prerequisite check result, when one ran.
    pub prerequisites: Option<PrerequisiteReport>,
    /// Snapshot taken before mutating.
    pub backup: Option<PathBuf>,
    /// What the mutation did.
    pub summary: Option<MutationSummary>,
    /// Error that ended the step.
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new(id: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            direction,
            state: RunState::Pending,
            skipped: false,
            prerequisites: None,
            backup: None,
            summary: None,
            error: None,
        }
    }

    /// A step the ledger already records; nothing runs.
    pub fn already_applied(id: impl Into<String>) -> Self {
        let mut record = Self::new(id, Direction::Forward);
        record.state = RunState::Committed;
        record.skipped = true;
        record
    }

    /// Move to `next`, logging illegal transitions.
    pub fn advance(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(step = %self.id, from = %self.state, to = %next, "Unexpected state transition");
        }
        tracing::debug!(step = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}

/// Run-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub database: PathBuf,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub backup_paths: Vec<PathBuf>,
    pub steps: Vec<StepRecord>,
}

/// Counters before the first step and after the last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub pre_migration: Option<ValidationReport>,
    pub post_migration: Option<ValidationReport>,
}

/// Audit record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub migration_info: MigrationInfo,
    pub validation_results: ValidationResults,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub migration_status: MigrationStatus,
}

impl RunArtifact {
    /// Start an artifact for a run against `database`.
    pub fn new(database: &Path, dry_run: bool) -> Self {
        Self {
            migration_info: MigrationInfo {
                database: database.to_path_buf(),
                dry_run,
                started_at: Utc::now(),
                finished_at: None,
                backup_paths: Vec::new(),
                steps: Vec::new(),
            },
            validation_results: ValidationResults::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            migration_status: MigrationStatus::Completed,
        }
    }

    /// Append a finished step, collecting its warnings and backup path.
    pub fn push_step(&mut self, record: StepRecord) {
        if let Some(summary) = &record.summary {
            self.warnings.extend(summary.warnings.iter().cloned());
        }
        if let Some(path) = &record.backup {
            self.migration_info.backup_paths.push(path.clone());
        }
        self.migration_info.steps.push(record);
    }

    /// Record a fatal error.
    pub fn fail(&mut self, error: &MigrationError) {
        self.errors.push(error.to_string());
        self.migration_status = MigrationStatus::Failed;
    }

    /// Stamp the finish time.
    pub fn finish(&mut self) {
        self.migration_info.finished_at = Some(Utc::now());
    }

    /// Whether the run completed without errors.
    pub fn succeeded(&self) -> bool {
        self.migration_status == MigrationStatus::Completed
    }

    /// Steps that actually ran to commit.
    pub fn committed(&self) -> impl Iterator<Item = &StepRecord> {
        self.migration_info
            .steps
            .iter()
            .filter(|s| s.state == RunState::Committed && !s.skipped)
    }

    /// Sum of every committed step's mutation summary.
    pub fn totals(&self) -> RunTotals {
        let mut totals = RunTotals::default();
        for summary in self.committed().filter_map(|s| s.summary.as_ref()) {
            totals.tables_created += summary.tables_created;
            totals.columns_added += summary.columns_added;
            totals.enums_created += summary.enums_created;
            totals.indexes_created += summary.indexes_created;
            totals.rows_seeded += summary.rows_seeded;
            totals.rows_skipped += summary.rows_skipped;
            totals.rows_repaired += summary.repaired.len();
            totals.tables_rebuilt += summary.rebuilds.len();
        }
        totals.warnings = self.warnings.len();
        totals.errors = self.errors.len();
        totals
    }

    /// Write the artifact as pretty JSON, replacing any previous file.
    pub fn write(&self, path: &Path) -> Result<(), MigrationError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read an artifact back.
    pub fn read(path: &Path) -> Result<Self, MigrationError> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| MigrationError::Serialization(e.to_string()))
    }
}

/// Counts shown in the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub tables_created: usize,
    pub columns_added: usize,
    pub enums_created: usize,
    pub indexes_created: usize,
    pub tables_rebuilt: usize,
    pub rows_seeded: usize,
    pub rows_skipped: usize,
    pub rows_repaired: usize,
    pub warnings: usize,
    pub errors: usize,
}
