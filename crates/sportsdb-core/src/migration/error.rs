//! Migration-specific error types.

use thiserror::Error;

/// Migration-specific errors.
///
/// `PrerequisiteMissing` and `BackupFailure` abort a run before anything is
/// mutated. `MutationFailure`, `IntegrityViolation` and `ValidationFailure`
/// are raised after a snapshot exists and always lead to a restore attempt.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A table, column or row count the step depends on is absent.
    #[error("prerequisites missing for step {step}: {}", missing.join("; "))]
    PrerequisiteMissing {
        /// The step being checked.
        step: String,
        /// One human-readable line per unmet requirement.
        missing: Vec<String>,
    },

    /// The source database could not be snapshotted.
    #[error("backup failed: {reason}")]
    BackupFailure {
        /// The reason the snapshot could not be taken.
        reason: String,
    },

    /// A DDL or DML statement failed inside the mutation transaction.
    #[error("mutation failed in step {step}: {message}")]
    MutationFailure {
        /// The step whose operations were running.
        step: String,
        /// Error message.
        message: String,
    },

    /// Row counts or foreign keys changed during a table rebuild.
    #[error("integrity violation on {table}: {message}")]
    IntegrityViolation {
        /// The table whose integrity check failed.
        table: String,
        /// Description of the observed delta.
        message: String,
    },

    /// Post-migration checks failed after the transaction committed.
    #[error("validation failed for step {step}: {}", failures.join("; "))]
    ValidationFailure {
        /// The step that was validated.
        step: String,
        /// One line per failed check.
        failures: Vec<String>,
    },

    /// A step was requested before its predecessor was applied.
    #[error("chain order violation: {message}")]
    ChainOrder {
        /// Description of the violation.
        message: String,
    },

    /// The loaded steps do not form a single linear history.
    #[error("invalid migration chain: {message}")]
    InvalidChain {
        /// Description of the defect.
        message: String,
    },

    /// The ledger recorded a different checksum than the chain defines.
    #[error("checksum mismatch for step {step}: ledger has {recorded}, chain defines {expected}")]
    ChecksumMismatch {
        /// The step whose definition drifted.
        step: String,
        /// Checksum stored in the ledger.
        recorded: String,
        /// Checksum computed from the current definition.
        expected: String,
    },

    /// Step not present in the chain.
    #[error("unknown migration step: {0}")]
    UnknownStep(String),

    /// Restoring the snapshot failed; the database needs manual repair.
    #[error("rollback failed, manual intervention required: {reason}")]
    RollbackFailed {
        /// The reason the restore or its sanity check failed.
        reason: String,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MigrationError {
    /// Whether this error was raised after a snapshot was taken and so
    /// requires the Rollback Executor.
    pub fn requires_restore(&self) -> bool {
        matches!(
            self,
            MigrationError::MutationFailure { .. }
                | MigrationError::IntegrityViolation { .. }
                | MigrationError::ValidationFailure { .. }
                | MigrationError::Database(_)
        )
    }

    /// Wrap any error raised inside the mutation phase as a `MutationFailure`.
    pub(crate) fn into_mutation_failure(self, step: &str) -> Self {
        match self {
            MigrationError::IntegrityViolation { .. } | MigrationError::MutationFailure { .. } => {
                self
            }
            other => MigrationError::MutationFailure {
                step: step.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::PrerequisiteMissing {
            step: "007_drop_teams_league_id".to_string(),
            missing: vec![
                "table team_league_memberships does not exist".to_string(),
                "table teams has 0 rows, requires at least 1".to_string(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("007_drop_teams_league_id"));
        assert!(text.contains("team_league_memberships does not exist; table teams"));
    }

    #[test]
    fn test_requires_restore() {
        let mutation = MigrationError::MutationFailure {
            step: "002".to_string(),
            message: "boom".to_string(),
        };
        assert!(mutation.requires_restore());

        let prereq = MigrationError::PrerequisiteMissing {
            step: "002".to_string(),
            missing: vec![],
        };
        assert!(!prereq.requires_restore());
        assert!(!MigrationError::BackupFailure { reason: "locked".into() }.requires_restore());
    }

    #[test]
    fn test_into_mutation_failure_keeps_integrity_violation() {
        let err = MigrationError::IntegrityViolation {
            table: "teams".to_string(),
            message: "50 rows before, 49 after".to_string(),
        };
        assert!(matches!(
            err.into_mutation_failure("007"),
            MigrationError::IntegrityViolation { .. }
        ));

        let err = MigrationError::Serialization("bad".to_string()).into_mutation_failure("007");
        assert!(matches!(err, MigrationError::MutationFailure { step, .. } if step == "007"));
    }
}
