//! Prerequisite validation.
//!
//! Read-only checks that the tables, columns and rows a step assumes are
//! present. A failure here is fatal for the run: nothing is backed up or
//! mutated.

use super::error::MigrationError;
use super::step::{MigrationStep, Operation};
use crate::schema::{column_exists, row_count, table_exists};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outcome of a prerequisite check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrerequisiteReport {
    /// The step checked.
    pub step: String,
    /// One line per unmet requirement; empty on PASS.
    pub missing: Vec<String>,
}

impl PrerequisiteReport {
    /// Whether every requirement was met.
    pub fn passed(&self) -> bool {
        self.missing.is_empty()
    }

    /// Convert a FAIL into a `PrerequisiteMissing` error.
    pub fn into_result(self) -> Result<(), MigrationError> {
        if self.passed() {
            Ok(())
        } else {
            Err(MigrationError::PrerequisiteMissing {
                step: self.step,
                missing: self.missing,
            })
        }
    }
}

/// Schema objects that earlier, not-yet-applied steps would create.
///
/// Used by dry runs to evaluate a later step as if its predecessors had
/// already run.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    tables: BTreeSet<String>,
    columns: BTreeSet<(String, String)>,
    seeded: BTreeSet<String>,
}

impl Projection {
    /// An empty projection: only the live schema counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a step's forward action into the projection.
    pub fn apply(&mut self, step: &MigrationStep) {
        for op in &step.forward {
            match op {
                Operation::CreateTable(def) => {
                    for column in &def.columns {
                        self.columns.insert((def.name.clone(), column.name.to_lowercase()));
                    }
                    self.tables.insert(def.name.clone());
                }
                Operation::CreateEnum { name, .. } => {
                    self.tables.insert(name.clone());
                    self.seeded.insert(name.clone());
                }
                Operation::AddColumn { table, column } => {
                    self.columns.insert((table.clone(), column.name.to_lowercase()));
                }
                Operation::Seed(set) => {
                    self.seeded.insert(set.table.clone());
                }
                Operation::Repair(spec) => {
                    self.seeded.insert(spec.membership.table.clone());
                }
                _ => {}
            }
        }
    }

    fn has_table(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns.contains(&(table.to_string(), column.to_lowercase()))
    }

    fn seeds(&self, table: &str) -> bool {
        self.seeded.contains(table)
    }
}

/// Checks a step's declared requirements against a live connection.
pub struct PrerequisiteValidator;

impl PrerequisiteValidator {
    /// Check a step against the live schema only.
    pub fn check(conn: &Connection, step: &MigrationStep) -> Result<PrerequisiteReport, MigrationError> {
        Self::check_projected(conn, step, &Projection::new())
    }

    /// Check a step against the live schema plus a projection of earlier
    /// pending steps.
    pub fn check_projected(
        conn: &Connection,
        step: &MigrationStep,
        projection: &Projection,
    ) -> Result<PrerequisiteReport, MigrationError> {
        let mut missing = Vec::new();
        let requires = &step.requires;

        for table in &requires.tables {
            if !projection.has_table(table) && !table_exists(conn, table)? {
                missing.push(format!("table {table} does not exist"));
            }
        }

        for (table, column) in &requires.columns {
            if projection.has_column(table, column) {
                continue;
            }
            if !table_exists(conn, table)? && !projection.has_table(table) {
                missing.push(format!("column {table}.{column} missing: table {table} does not exist"));
            } else if !column_exists(conn, table, column)? {
                missing.push(format!("column {table}.{column} does not exist"));
            }
        }

        for (table, min) in &requires.min_rows {
            if projection.seeds(table) {
                continue;
            }
            if !table_exists(conn, table)? {
                if !projection.has_table(table) {
                    missing.push(format!("table {table} does not exist (needs at least {min} rows)"));
                } else {
                    missing.push(format!("table {table} would be empty, requires at least {min} rows"));
                }
                continue;
            }
            let rows = row_count(conn, table)?;
            if rows < *min {
                missing.push(format!("table {table} has {rows} rows, requires at least {min}"));
            }
        }

        Ok(PrerequisiteReport {
            step: step.id.clone(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, TableDef};

    fn step() -> MigrationStep {
        MigrationStep::new("007", Some("006"), "drop league_id")
            .requires_table("teams")
            .requires_table("team_league_memberships")
            .requires_column("teams", "league_id")
            .requires_rows("leagues", 1)
    }

    #[test]
    fn test_missing_tables_fail() {
        let conn = Connection::open_in_memory().unwrap();
        let report = PrerequisiteValidator::check(&conn, &step()).unwrap();
        assert!(!report.passed());
        assert_eq!(report.missing.len(), 4);
        assert!(report.missing[0].contains("table teams does not exist"));
        assert!(matches!(
            report.into_result(),
            Err(MigrationError::PrerequisiteMissing { .. })
        ));
    }

    #[test]
    fn test_empty_table_fails_then_passes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE teams (id TEXT, league_id TEXT);
             CREATE TABLE team_league_memberships (team_id TEXT);
             CREATE TABLE leagues (id TEXT);",
        )
        .unwrap();

        let report = PrerequisiteValidator::check(&conn, &step()).unwrap();
        assert_eq!(report.missing, vec!["table leagues has 0 rows, requires at least 1"]);

        conn.execute("INSERT INTO leagues VALUES ('l1')", []).unwrap();
        assert!(PrerequisiteValidator::check(&conn, &step()).unwrap().passed());
    }

    #[test]
    fn test_projection_satisfies_later_steps() {
        let conn = Connection::open_in_memory().unwrap();
        let earlier = MigrationStep::new("001", None, "tables")
            .forward(Operation::CreateTable(
                TableDef::new("teams")
                    .column(ColumnDef::text_key("id"))
                    .column(ColumnDef::new("league_id", "TEXT")),
            ))
            .forward(Operation::CreateTable(
                TableDef::new("team_league_memberships").column(ColumnDef::new("team_id", "TEXT")),
            ))
            .forward(Operation::CreateTable(TableDef::new("leagues").column(ColumnDef::text_key("id"))))
            .forward(Operation::Seed(crate::migration::seed::SeedSet::new("leagues")));

        let mut projection = Projection::new();
        projection.apply(&earlier);
        let report = PrerequisiteValidator::check_projected(&conn, &step(), &projection).unwrap();
        assert!(report.passed(), "{:?}", report.missing);
    }
}
