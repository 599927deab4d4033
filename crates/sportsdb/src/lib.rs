//! Migration runner for the sportsdb schema.
//!
//! Each step runs through
//! `PENDING → PREREQS_CHECKED → BACKED_UP → MUTATING → VALIDATING → {COMMITTED | ROLLED_BACK}`:
//!
//! | Phase | Component | On failure |
//! |-------|-----------|------------|
//! | prerequisites | [`PrerequisiteValidator`](sportsdb_core::PrerequisiteValidator) | `ABORTED` |
//! | backup | [`BackupManager`](sportsdb_backup::BackupManager) | `ABORTED` |
//! | mutation | [`SchemaMutator`](sportsdb_core::SchemaMutator) | restore, `ROLLED_BACK` |
//! | validation | [`PostMigrationValidator`](sportsdb_core::PostMigrationValidator) | restore, `ROLLED_BACK` |
//!
//! Every run produces a [`RunArtifact`], written as JSON for audit.
//!
//! # Example
//!
//! ```ignore
//! use sportsdb::{MigrationConfig, MigrationRunner};
//!
//! let runner = MigrationRunner::new(MigrationConfig::new("sports.db"))?;
//! let artifact = runner.run(None).into_result()?;
//! println!("{} steps", artifact.migration_info.steps.len());
//! ```

pub mod artifact;
pub mod config;
pub mod rollback;
pub mod runner;
pub mod state;

pub use artifact::{MigrationInfo, MigrationStatus, RunArtifact, RunTotals, StepRecord, ValidationResults};
pub use config::{MigrationConfig, DEFAULT_RESULTS_FILE};
pub use rollback::RollbackExecutor;
pub use runner::{MigrationRunner, RunOutcome, StepState, StepStatus};
pub use state::RunState;

pub use sportsdb_backup;
pub use sportsdb_core;
