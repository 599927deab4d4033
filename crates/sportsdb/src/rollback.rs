//! Rollback Executor - restore the pre-step snapshot and prove it worked.

use rusqlite::{Connection, OpenFlags};
use sportsdb_backup::{BackupHandle, BackupManager};
use sportsdb_core::{MigrationError, ValidationReport};
use tracing::{error, info};

/// Restores snapshots taken before a step.
pub struct RollbackExecutor<'a> {
    backups: &'a BackupManager,
}

impl<'a> RollbackExecutor<'a> {
    pub fn new(backups: &'a BackupManager) -> Self {
        Self { backups }
    }

    /// Restore `handle` over its source database and run a sanity check.
    ///
    /// All connections to the database must be closed by the caller.
    /// Any failure is reported as `RollbackFailed`.
    pub fn rollback(&self, handle: &BackupHandle) -> Result<(), MigrationError> {
        info!(backup = %handle.id, database = %handle.source.display(), "Rolling back");

        self.backups.restore(handle).map_err(|e| {
            escalate(format!("restore of {} failed: {e}", handle.id))
        })?;
        sanity_check(handle).map_err(|reason| escalate(format!("restored database {reason}")))?;

        info!(backup = %handle.id, "Rollback complete");
        Ok(())
    }
}

/// File exists, opens, and every table counted at backup time is queryable
/// with the same row count.
fn sanity_check(handle: &BackupHandle) -> Result<(), String> {
    if !handle.source.is_file() {
        return Err("is missing".to_string());
    }
    let conn = Connection::open_with_flags(&handle.source, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| format!("cannot be opened: {e}"))?;
    let report = ValidationReport::capture(&conn).map_err(|e| format!("cannot be queried: {e}"))?;

    if report.row_counts != handle.baseline.row_counts {
        let deltas = handle.baseline.row_deltas(&report);
        return Err(format!("differs from its baseline: {deltas:?}"));
    }
    Ok(())
}

fn escalate(reason: String) -> MigrationError {
    error!(%reason, "Rollback failed, manual intervention required");
    MigrationError::RollbackFailed { reason }
}
