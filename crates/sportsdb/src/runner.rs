//! Migration runner - drives each step through the run state machine.

use crate::artifact::{RunArtifact, StepRecord};
use crate::config::MigrationConfig;
use crate::rollback::RollbackExecutor;
use crate::state::RunState;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use sportsdb_backup::{BackupHandle, BackupManager};
use sportsdb_core::catalog::league_orphan_check;
use sportsdb_core::migration::{ledger, CheckFailure, CheckKind};
use sportsdb_core::schema::set_foreign_keys;
use sportsdb_core::{
    builtin_chain, Direction, MigrationChain, MigrationError, MigrationStep,
    PostMigrationValidator, PrerequisiteValidator, Projection, SchemaMutator, ValidationReport,
};
use tracing::{error, info, warn};

/// Result of a run: the artifact, plus the error that ended it, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub artifact: RunArtifact,
    pub error: Option<MigrationError>,
}

impl RunOutcome {
    /// Whether the run completed.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// The artifact on success, the error otherwise.
    pub fn into_result(self) -> Result<RunArtifact, MigrationError> {
        match self.error {
            None => Ok(self.artifact),
            Some(e) => Err(e),
        }
    }
}

/// Ledger state of a chain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Applied,
    Pending,
    /// Applied, but the ledger checksum no longer matches the definition.
    Drifted,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Applied => write!(f, "applied"),
            StepState::Pending => write!(f, "pending"),
            StepState::Drifted => write!(f, "drifted"),
        }
    }
}

/// One line of `status` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub id: String,
    pub description: String,
    pub state: StepState,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Applies and reverts steps of a migration chain against one database.
pub struct MigrationRunner {
    config: MigrationConfig,
    chain: MigrationChain,
    backups: BackupManager,
}

impl MigrationRunner {
    /// Runner over the built-in chain.
    pub fn new(config: MigrationConfig) -> Result<Self, MigrationError> {
        Ok(Self::with_chain(config, builtin_chain()?))
    }

    /// Runner over a custom chain.
    pub fn with_chain(config: MigrationConfig, chain: MigrationChain) -> Self {
        let backups = BackupManager::new(config.backup_config());
        Self {
            config,
            chain,
            backups,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn chain(&self) -> &MigrationChain {
        &self.chain
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Apply every pending step up to and including `target` (or the tip).
    pub fn run(&self, target: Option<&str>) -> RunOutcome {
        let mut artifact = RunArtifact::new(&self.config.db_path, self.config.dry_run);
        let result = if self.config.dry_run {
            self.dry_run_forward(target, &mut artifact)
        } else {
            self.run_forward(target, &mut artifact)
        };
        self.conclude(artifact, result)
    }

    /// Apply exactly one step, which must be next in the chain.
    pub fn apply_step(&self, id: &str) -> RunOutcome {
        let mut artifact = RunArtifact::new(&self.config.db_path, self.config.dry_run);
        let result = self.apply_one(id, &mut artifact);
        self.conclude(artifact, result)
    }

    /// Apply the reverse action of the most recently applied step.
    pub fn revert(&self) -> RunOutcome {
        let mut artifact = RunArtifact::new(&self.config.db_path, self.config.dry_run);
        let result = self.revert_tip(&mut artifact);
        self.conclude(artifact, result)
    }

    /// Applied/pending state of every chain step.
    pub fn status(&self) -> Result<Vec<StepStatus>, MigrationError> {
        let conn = self.open_read_only()?;
        let applied = ledger::applied(&conn)?;

        Ok(self
            .chain
            .steps()
            .iter()
            .map(|step| {
                let entry = applied.iter().find(|e| e.id == step.id);
                let state = match entry {
                    None => StepState::Pending,
                    Some(e) if e.checksum == step.checksum() => StepState::Applied,
                    Some(_) => StepState::Drifted,
                };
                StepStatus {
                    id: step.id.clone(),
                    description: step.description.clone(),
                    state,
                    applied_at: entry.map(|e| e.applied_at),
                }
            })
            .collect())
    }

    /// Read-only integrity check: counters, foreign-key scan and the league
    /// orphan scan for `season` (or the default season).
    pub fn check(&self, season: Option<i64>) -> Result<ValidationReport, MigrationError> {
        let conn = Connection::open_with_flags(&self.config.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut orphans = league_orphan_check();
        if season.is_some() {
            orphans.season = season;
        }

        let mut report = ValidationReport::capture_with_orphans(&conn, &[orphans])?;
        if report.foreign_key_violations != 0 {
            report.violations.push(CheckFailure {
                check: CheckKind::ForeignKeys,
                subject: "foreign_key_check".to_string(),
                expected: "0".to_string(),
                observed: report.foreign_key_violations.to_string(),
            });
        }
        let orphaned: Vec<CheckFailure> = report
            .orphan_counts
            .iter()
            .filter(|(_, count)| **count != 0)
            .map(|(label, count)| CheckFailure {
                check: CheckKind::Orphans,
                subject: label.clone(),
                expected: "0".to_string(),
                observed: count.to_string(),
            })
            .collect();
        report.violations.extend(orphaned);

        info!(
            database = %self.config.db_path.display(),
            tables = report.row_counts.len(),
            violations = report.violations.len(),
            "Integrity check finished"
        );
        Ok(report)
    }

    fn run_forward(&self, target: Option<&str>, artifact: &mut RunArtifact) -> Result<(), MigrationError> {
        let conn = self.open()?;
        let steps = self.plan_forward(&conn, target)?;
        artifact.validation_results.pre_migration = Some(ValidationReport::capture(&conn)?);
        drop(conn);

        if steps.is_empty() {
            info!(database = %self.config.db_path.display(), "Database is up to date");
        }
        for step in steps {
            self.execute(step, Direction::Forward, artifact)?;
        }
        Ok(())
    }

    fn dry_run_forward(&self, target: Option<&str>, artifact: &mut RunArtifact) -> Result<(), MigrationError> {
        let conn = self.open_read_only()?;
        let steps = self.plan_forward(&conn, target)?;
        artifact.validation_results.pre_migration = Some(ValidationReport::capture(&conn)?);

        let mut projection = Projection::new();
        for step in steps {
            self.dry_run_step(&conn, step, &projection, artifact)?;
            projection.apply(step);
        }
        Ok(())
    }

    fn apply_one(&self, id: &str, artifact: &mut RunArtifact) -> Result<(), MigrationError> {
        let conn = if self.config.dry_run {
            self.open_read_only()?
        } else {
            self.open()?
        };
        let applied = ledger::applied(&conn)?;
        let runnable = self.chain.check_applicable(id, &applied)?;
        artifact.validation_results.pre_migration = Some(ValidationReport::capture(&conn)?);

        let step = self
            .chain
            .get(id)
            .ok_or_else(|| MigrationError::UnknownStep(id.to_string()))?;
        if !runnable {
            info!(step = %id, "Step already applied, skipping");
            artifact.push_step(StepRecord::already_applied(id));
            return Ok(());
        }

        if self.config.dry_run {
            return self.dry_run_step(&conn, step, &Projection::new(), artifact);
        }
        drop(conn);
        self.execute(step, Direction::Forward, artifact)
    }

    fn revert_tip(&self, artifact: &mut RunArtifact) -> Result<(), MigrationError> {
        let conn = if self.config.dry_run {
            self.open_read_only()?
        } else {
            self.open()?
        };
        let applied = ledger::applied(&conn)?;
        let prefix = self.chain.verify_ledger(&applied)?;
        artifact.validation_results.pre_migration = Some(ValidationReport::capture(&conn)?);
        drop(conn);

        let step = match prefix.checked_sub(1) {
            Some(last) => &self.chain.steps()[last],
            None => {
                return Err(MigrationError::ChainOrder {
                    message: "no applied steps to revert".to_string(),
                })
            }
        };
        if step.reverse.is_empty() {
            return Err(MigrationError::ChainOrder {
                message: format!("step {} has no reverse action", step.id),
            });
        }

        if self.config.dry_run {
            let mut record = StepRecord::new(&step.id, Direction::Reverse);
            record.advance(RunState::PrereqsChecked);
            info!(step = %step.id, operations = step.reverse.len(), "Dry run: would revert");
            artifact.push_step(record);
            return Ok(());
        }
        self.execute(step, Direction::Reverse, artifact)
    }

    /// Pending steps up to `target`, after checking the ledger against the chain.
    fn plan_forward<'a>(
        &'a self,
        conn: &Connection,
        target: Option<&str>,
    ) -> Result<Vec<&'a MigrationStep>, MigrationError> {
        let applied = ledger::applied(conn)?;
        let pending = self.chain.pending(&applied)?;
        let Some(target) = target else {
            return Ok(pending.iter().collect());
        };

        let position = self
            .chain
            .position(target)
            .ok_or_else(|| MigrationError::UnknownStep(target.to_string()))?;
        let done = self.chain.len() - pending.len();
        if position < done {
            return Ok(Vec::new());
        }
        Ok(pending[..=position - done].iter().collect())
    }

    fn dry_run_step(
        &self,
        conn: &Connection,
        step: &MigrationStep,
        projection: &Projection,
        artifact: &mut RunArtifact,
    ) -> Result<(), MigrationError> {
        let mut record = StepRecord::new(&step.id, Direction::Forward);
        let report = PrerequisiteValidator::check_projected(conn, step, projection)?;
        record.prerequisites = Some(report.clone());

        match report.into_result() {
            Ok(()) => {
                record.advance(RunState::PrereqsChecked);
                info!(
                    step = %step.id,
                    operations = step.forward.len(),
                    destructive = step.is_destructive(),
                    "Dry run: would apply"
                );
                artifact.push_step(record);
                Ok(())
            }
            Err(e) => {
                record.advance(RunState::Aborted);
                record.error = Some(e.to_string());
                artifact.push_step(record);
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        step: &MigrationStep,
        direction: Direction,
        artifact: &mut RunArtifact,
    ) -> Result<(), MigrationError> {
        let mut record = StepRecord::new(&step.id, direction);
        let result = self.execute_step(step, direction, &mut record);
        if let Err(e) = &result {
            record.error = Some(e.to_string());
        }
        artifact.push_step(record);
        result
    }

    fn execute_step(
        &self,
        step: &MigrationStep,
        direction: Direction,
        record: &mut StepRecord,
    ) -> Result<(), MigrationError> {
        info!(step = %step.id, %direction, description = %step.description, "Starting step");
        let mut conn = self.open()?;

        if direction == Direction::Forward {
            let report = match PrerequisiteValidator::check(&conn, step) {
                Ok(report) => report,
                Err(e) => return Err(self.fail(None, e, record)),
            };
            record.prerequisites = Some(report.clone());
            if let Err(e) = report.into_result() {
                warn!(step = %step.id, error = %e, "Prerequisites not met");
                return Err(self.fail(None, e, record));
            }
        }
        record.advance(RunState::PrereqsChecked);

        let handle = match self.backups.create_backup(&self.config.db_path) {
            Ok(handle) => handle,
            Err(e) => {
                let cause = MigrationError::BackupFailure {
                    reason: e.to_string(),
                };
                return Err(self.fail(None, cause, record));
            }
        };
        record.backup = Some(handle.path.clone());
        record.advance(RunState::BackedUp);

        record.advance(RunState::Mutating);
        let summary = match SchemaMutator::apply(&mut conn, step, direction) {
            Ok(summary) => summary,
            Err(e) => {
                drop(conn);
                return Err(self.fail(Some(&handle), e, record));
            }
        };

        record.advance(RunState::Validating);
        let report =
            PostMigrationValidator::validate(&conn, step, direction, &handle.baseline, &summary);
        record.summary = Some(summary);
        if let Err(e) = PostMigrationValidator::into_result(&step.id, &report) {
            drop(conn);
            return Err(self.fail(Some(&handle), e, record));
        }

        record.advance(RunState::Committed);
        info!(step = %step.id, %direction, "Step committed");
        Ok(())
    }

    /// Settle a failed step. Errors raised once a snapshot exists restore it;
    /// anything else aborts the step with the database untouched.
    fn fail(
        &self,
        handle: Option<&BackupHandle>,
        cause: MigrationError,
        record: &mut StepRecord,
    ) -> MigrationError {
        match handle {
            Some(handle) if cause.requires_restore() => self.roll_back(handle, cause, record),
            _ => {
                record.advance(RunState::Aborted);
                cause
            }
        }
    }

    /// Restore the snapshot after `cause`. Returns `cause` when the restore
    /// succeeded, `RollbackFailed` otherwise.
    fn roll_back(&self, handle: &BackupHandle, cause: MigrationError, record: &mut StepRecord) -> MigrationError {
        warn!(step = %record.id, error = %cause, "Step failed, restoring snapshot");
        match RollbackExecutor::new(&self.backups).rollback(handle) {
            Ok(()) => {
                record.advance(RunState::RolledBack);
                cause
            }
            Err(e) => {
                error!(step = %record.id, error = %e, "Database left in an unknown state");
                MigrationError::RollbackFailed {
                    reason: format!("step {} failed ({cause}); {e}", record.id),
                }
            }
        }
    }

    fn conclude(&self, mut artifact: RunArtifact, result: Result<(), MigrationError>) -> RunOutcome {
        if let Err(e) = &result {
            error!(error = %e, "Migration run failed");
            artifact.fail(e);
        }
        if !self.config.dry_run {
            match self.capture_current() {
                Ok(report) => artifact.validation_results.post_migration = report,
                Err(e) => warn!(error = %e, "Could not capture post-migration counters"),
            }
        }
        artifact.finish();

        if self.config.write_results {
            let path = &self.config.results_path;
            match artifact.write(path) {
                Ok(()) => info!(path = %path.display(), "Results written"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not write results");
                    artifact.warnings.push(format!("results not written: {e}"));
                }
            }
        }

        RunOutcome {
            artifact,
            error: result.err(),
        }
    }

    fn capture_current(&self) -> Result<Option<ValidationReport>, MigrationError> {
        if !self.config.db_path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(&self.config.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Some(ValidationReport::capture(&conn)?))
    }

    /// Read-write connection, created if missing, with foreign keys enforced.
    fn open(&self) -> Result<Connection, MigrationError> {
        let conn = Connection::open(&self.config.db_path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        set_foreign_keys(&conn, true)?;
        Ok(conn)
    }

    /// Read-only connection; an empty in-memory database stands in for a
    /// missing file so nothing is created on disk.
    fn open_read_only(&self) -> Result<Connection, MigrationError> {
        let conn = if self.config.db_path.exists() {
            Connection::open_with_flags(&self.config.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            Connection::open_in_memory()?
        };
        conn.busy_timeout(self.config.busy_timeout)?;
        Ok(conn)
    }
}
