//! sportsdb Core - schema migration, validation and repair engine.
//!
//! This crate provides the embedded-engine side of sportsdb: schema
//! introspection and DDL builders, the migration chain and ledger, the
//! prerequisite and post-migration validators, the transactional schema
//! mutator, seeding and relationship repair, and the built-in chain for the
//! sports platform schema.

pub mod catalog;
pub mod migration;
pub mod schema;

pub use catalog::{builtin_chain, builtin_steps};
pub use migration::{
    Direction, LedgerEntry, MigrationChain, MigrationError, MigrationStep, MutationSummary,
    Operation, PostMigrationValidator, PrerequisiteReport, PrerequisiteValidator, Projection,
    RepairReport, SchemaMutator, ValidationReport,
};
pub use schema::{ColumnDef, IndexDef, TableDef};

/// Re-export of the SQLite driver so callers share one version.
pub use rusqlite;
