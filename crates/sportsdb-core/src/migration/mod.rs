//! Migration engine for the sportsdb schema.
//!
//! This module provides safe, forward-only schema evolution with:
//! - A linear chain of checksummed steps and a persisted ledger
//! - Read-only prerequisite gates
//! - Transactional mutation, including the table rebuild pattern
//! - Idempotent seeding and relationship repair
//! - Post-migration validation against a captured baseline
//!
//! # Control flow
//!
//! | Phase | Component | On failure |
//! |-------|-----------|------------|
//! | 1 | [`PrerequisiteValidator`] | abort, nothing touched |
//! | 2 | backup (see the `sportsdb-backup` crate) | abort, nothing touched |
//! | 3 | [`SchemaMutator`] | transaction rollback, then restore |
//! | 4 | [`PostMigrationValidator`] | restore |
//!
//! # Example
//!
//! ```ignore
//! use sportsdb_core::migration::{Direction, PrerequisiteValidator, SchemaMutator};
//!
//! PrerequisiteValidator::check(&conn, &step)?.into_result()?;
//! let baseline = ValidationReport::capture(&conn)?;
//! let summary = SchemaMutator::apply(&mut conn, &step, Direction::Forward)?;
//! let report = PostMigrationValidator::validate(&conn, &step, Direction::Forward, &baseline, &summary);
//! PostMigrationValidator::into_result(&step.id, &report)?;
//! ```

pub mod chain;
pub mod error;
pub mod ledger;
pub mod mutator;
pub mod prereq;
pub mod rebuild;
pub mod repair;
pub mod report;
pub mod seed;
pub mod step;
pub mod validate;

// Re-export main types

// Chain and ledger
pub use chain::MigrationChain;
pub use ledger::{LedgerEntry, LEDGER_TABLE};

// Error types
pub use error::MigrationError;

// Step definitions
pub use step::{
    ColumnRename, Expectations, MigrationStep, Operation, OrphanCheck, Prerequisites, RebuildSpec,
};

// Validation
pub use prereq::{PrerequisiteReport, PrerequisiteValidator, Projection};
pub use report::{CheckFailure, CheckKind, ValidationReport};
pub use validate::PostMigrationValidator;

// Mutation
pub use mutator::{Direction, MutationSummary, SchemaMutator};
pub use rebuild::RebuildSummary;

// Seeding and repair
pub use repair::{
    count_orphans, MembershipHint, MembershipTable, RepairReport, RepairSource, RepairSpec,
    RepairWarning, RepairedRow,
};
pub use seed::{slugify, SeedError, SeedOutcome, SeedRow, SeedSet, SeedValue};
