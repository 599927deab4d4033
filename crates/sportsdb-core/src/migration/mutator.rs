//! Schema Mutator - applies a step's operations inside one transaction.
//!
//! Additive operations are idempotent: tables, indexes, triggers and views
//! use `IF NOT EXISTS`, columns and enum types are checked before creation.
//! Destructive column changes go through the [rebuild pattern](super::rebuild).
//!
//! Foreign-key enforcement cannot be toggled inside a transaction, so when
//! a step rebuilds a table the prior setting is recorded, enforcement is
//! switched off before `BEGIN`, a full `foreign_key_check` runs before
//! `COMMIT`, and the prior setting is restored afterwards on every path.

use super::error::MigrationError;
use super::ledger;
use super::rebuild::{rebuild_table, RebuildSummary};
use super::repair::{repair_memberships, RepairedRow};
use super::seed::insert_seed_set;
use super::step::{MigrationStep, Operation};
use crate::schema::{
    column_exists, foreign_key_violations, foreign_keys_enabled, index_exists, quote_ident,
    set_foreign_keys, table_exists, touch_trigger_name, touch_trigger_sql, view_exists,
};
use crate::schema::introspect::trigger_exists;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Which of a step's actions to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Apply the forward action and record the step in the ledger.
    Forward,
    /// Apply the reverse action and remove the step from the ledger.
    Reverse,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// Counts of what a mutation created or changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationSummary {
    /// Step applied.
    pub step: String,
    /// Tables created (pre-existing ones are not counted).
    pub tables_created: usize,
    /// Columns added.
    pub columns_added: usize,
    /// Enum lookup tables created.
    pub enums_created: usize,
    /// Indexes created.
    pub indexes_created: usize,
    /// Triggers created.
    pub triggers_created: usize,
    /// Views created.
    pub views_created: usize,
    /// Tables dropped.
    pub tables_dropped: usize,
    /// Seed and enum rows inserted.
    pub rows_seeded: usize,
    /// Seed rows skipped because their key already existed.
    pub rows_skipped: usize,
    /// Rows deleted by `DeleteSeeded`.
    pub rows_deleted: usize,
    /// Keys of the seed rows inserted, per table. Recorded in the ledger.
    #[serde(default)]
    pub seeded_keys: ledger::SeededRows,
    /// Membership rows inserted by repairs.
    pub repaired: Vec<RepairedRow>,
    /// Table rebuilds performed.
    pub rebuilds: Vec<RebuildSummary>,
    /// Non-fatal warnings (skipped repairs).
    pub warnings: Vec<String>,
}

impl MutationSummary {
    fn new(step: &str) -> Self {
        Self {
            step: step.to_string(),
            ..Self::default()
        }
    }

    /// Whether the mutation changed nothing.
    pub fn is_noop(&self) -> bool {
        self.tables_created == 0
            && self.columns_added == 0
            && self.enums_created == 0
            && self.indexes_created == 0
            && self.triggers_created == 0
            && self.views_created == 0
            && self.tables_dropped == 0
            && self.rows_seeded == 0
            && self.rows_deleted == 0
            && self.repaired.is_empty()
            && self.rebuilds.is_empty()
    }
}

/// Applies operations transactionally.
pub struct SchemaMutator;

impl SchemaMutator {
    /// Apply a step's forward or reverse action and update the ledger in the
    /// same transaction.
    pub fn apply(
        conn: &mut Connection,
        step: &MigrationStep,
        direction: Direction,
    ) -> Result<MutationSummary, MigrationError> {
        let ops = match direction {
            Direction::Forward => &step.forward,
            Direction::Reverse => &step.reverse,
        };
        info!(step = %step.id, %direction, operations = ops.len(), "applying step");
        Self::run(conn, &step.id, ops, Some((step, direction)))
    }

    /// Apply operations without touching the ledger.
    pub fn apply_operations(
        conn: &mut Connection,
        step: &str,
        ops: &[Operation],
    ) -> Result<MutationSummary, MigrationError> {
        Self::run(conn, step, ops, None)
    }

    fn run(
        conn: &mut Connection,
        step: &str,
        ops: &[Operation],
        ledger_update: Option<(&MigrationStep, Direction)>,
    ) -> Result<MutationSummary, MigrationError> {
        let rebuilding = MigrationStep::has_rebuild(ops);
        let prior = foreign_keys_enabled(conn)?;
        if rebuilding && prior {
            set_foreign_keys(conn, false)?;
            debug!(step, "foreign keys suspended for rebuild");
        }

        let result = Self::transact(conn, step, ops, ledger_update, rebuilding);

        if rebuilding && prior {
            match set_foreign_keys(conn, true) {
                Ok(()) => debug!(step, "foreign keys restored"),
                Err(e) => {
                    error!(step, error = %e, "failed to restore foreign key enforcement");
                    if result.is_ok() {
                        return Err(e.into());
                    }
                }
            }
        }
        result
    }

    fn transact(
        conn: &mut Connection,
        step: &str,
        ops: &[Operation],
        ledger_update: Option<(&MigrationStep, Direction)>,
        rebuilding: bool,
    ) -> Result<MutationSummary, MigrationError> {
        let tx = conn.transaction()?;
        let mut summary = MutationSummary::new(step);

        let outcome = Self::apply_all(&tx, step, ops, &mut summary).and_then(|()| {
            if rebuilding {
                check_foreign_keys(&tx)?;
            }
            match ledger_update {
                Some((s, Direction::Forward)) => ledger::record(&tx, s, &summary.seeded_keys)?,
                Some((s, Direction::Reverse)) => {
                    ledger::remove(&tx, &s.id)?;
                }
                None => {}
            }
            Ok(())
        });

        match outcome {
            Ok(()) => {
                tx.commit()
                    .map_err(|e| MigrationError::from(e).into_mutation_failure(step))?;
                info!(
                    step,
                    tables = summary.tables_created,
                    indexes = summary.indexes_created,
                    seeded = summary.rows_seeded,
                    repaired = summary.repaired.len(),
                    rebuilds = summary.rebuilds.len(),
                    "transaction committed"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(step, error = %e, "rolling back transaction");
                if let Err(rollback) = tx.rollback() {
                    error!(step, error = %rollback, "transaction rollback failed");
                }
                Err(e.into_mutation_failure(step))
            }
        }
    }

    fn apply_all(
        conn: &Connection,
        step: &str,
        ops: &[Operation],
        summary: &mut MutationSummary,
    ) -> Result<(), MigrationError> {
        for op in ops {
            Self::apply_one(conn, step, op, summary)?;
        }
        Ok(())
    }

    fn apply_one(
        conn: &Connection,
        step: &str,
        op: &Operation,
        summary: &mut MutationSummary,
    ) -> Result<(), MigrationError> {
        match op {
            Operation::CreateTable(def) => {
                let existed = table_exists(conn, &def.name)?;
                conn.execute_batch(&def.create_sql())?;
                if !existed {
                    summary.tables_created += 1;
                    info!(step, table = %def.name, "created table");
                }
            }
            Operation::AddColumn { table, column } => {
                if column_exists(conn, table, &column.name)? {
                    debug!(step, table = %table, column = %column.name, "column exists, skipping");
                } else {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote_ident(table),
                        column.to_sql()
                    ))?;
                    summary.columns_added += 1;
                    info!(step, table = %table, column = %column.name, "added column");
                }
            }
            Operation::CreateEnum { name, values } => {
                if !table_exists(conn, name)? {
                    conn.execute_batch(&format!(
                        "CREATE TABLE {} (\"value\" TEXT PRIMARY KEY NOT NULL)",
                        quote_ident(name)
                    ))?;
                    summary.enums_created += 1;
                    info!(step, enum_type = %name, values = values.len(), "created enum type");
                }
                let sql = format!(
                    "INSERT INTO {} (\"value\") VALUES (?1) ON CONFLICT DO NOTHING",
                    quote_ident(name)
                );
                let mut stmt = conn.prepare(&sql)?;
                for value in values {
                    summary.rows_seeded += stmt.execute(params![value])?;
                }
            }
            Operation::CreateIndex(index) => {
                let existed = index_exists(conn, &index.name)?;
                conn.execute_batch(&index.create_sql())?;
                if !existed {
                    summary.indexes_created += 1;
                    debug!(step, index = %index.name, "created index");
                }
            }
            Operation::CreateTouchTrigger { table } => {
                let existed = trigger_exists(conn, &touch_trigger_name(table))?;
                conn.execute_batch(&touch_trigger_sql(table))?;
                if !existed {
                    summary.triggers_created += 1;
                }
            }
            Operation::CreateView { name, select } => {
                let existed = view_exists(conn, name)?;
                conn.execute_batch(&format!(
                    "CREATE VIEW IF NOT EXISTS {} AS {}",
                    quote_ident(name),
                    select
                ))?;
                if !existed {
                    summary.views_created += 1;
                }
            }
            Operation::RebuildTable(spec) => {
                let rebuilt = rebuild_table(conn, step, spec)?;
                summary.rebuilds.push(rebuilt);
            }
            Operation::Seed(set) => {
                let outcome = insert_seed_set(conn, set).map_err(|e| MigrationError::MutationFailure {
                    step: step.to_string(),
                    message: e.to_string(),
                })?;
                summary.rows_seeded += outcome.inserted;
                summary.rows_skipped += outcome.skipped;
                info!(
                    step,
                    table = %set.table,
                    inserted = outcome.inserted,
                    skipped = outcome.skipped,
                    "seeded reference rows"
                );
                if !outcome.keys.is_empty() {
                    summary
                        .seeded_keys
                        .entry(set.table.clone())
                        .or_default()
                        .extend(outcome.keys);
                }
            }
            Operation::Repair(spec) => {
                let report = repair_memberships(conn, step, spec)?;
                summary
                    .warnings
                    .extend(report.skipped.iter().map(ToString::to_string));
                summary.repaired.extend(report.repaired);
            }
            Operation::DropTable { name } => {
                if table_exists(conn, name)? {
                    conn.execute_batch(&format!("DROP TABLE {}", quote_ident(name)))?;
                    summary.tables_dropped += 1;
                    info!(step, table = %name, "dropped table");
                }
            }
            Operation::DropIndex { name } => {
                conn.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(name)))?;
            }
            Operation::DropView { name } => {
                conn.execute_batch(&format!("DROP VIEW IF EXISTS {}", quote_ident(name)))?;
            }
            Operation::DeleteSeeded { table } => {
                let keys = ledger::seeded_rows(conn, step)?
                    .remove(table)
                    .unwrap_or_default();
                if !keys.is_empty() && table_exists(conn, table)? {
                    let sql = format!("DELETE FROM {} WHERE \"id\" = ?1", quote_ident(table));
                    let mut stmt = conn.prepare(&sql)?;
                    let mut deleted = 0;
                    for key in &keys {
                        deleted += stmt.execute(params![key])?;
                    }
                    summary.rows_deleted += deleted;
                    info!(step, table = %table, deleted, "deleted seeded rows");
                }
            }
            Operation::Execute { sql, .. } => {
                conn.execute_batch(sql)?;
            }
        }
        Ok(())
    }
}

fn check_foreign_keys(conn: &Connection) -> Result<(), MigrationError> {
    let violations = foreign_key_violations(conn)?;
    if let Some(first) = violations.first() {
        return Err(MigrationError::IntegrityViolation {
            table: first.table.clone(),
            message: format!(
                "{} foreign key violations after rebuild (first references {})",
                violations.len(),
                first.parent
            ),
        });
    }
    Ok(())
}
