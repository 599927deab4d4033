//! Post-Migration Validator.
//!
//! Re-derives a [`ValidationReport`] after a mutation and diffs it against
//! the baseline captured before the step. Each check passes or fails on its
//! own; any error while validating is recorded as a failure, never as a pass.

use super::error::MigrationError;
use super::ledger::LEDGER_TABLE;
use super::mutator::{Direction, MutationSummary};
use super::report::{CheckFailure, CheckKind, ValidationReport};
use super::step::{MigrationStep, Operation, OrphanCheck};
use crate::schema::{column_exists, table_exists};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Checks the database against a step's contract after mutation.
pub struct PostMigrationValidator;

impl PostMigrationValidator {
    /// Validate the database after `step` ran in `direction`.
    ///
    /// The returned report always carries the observed counters (when they
    /// could be captured) plus one [`CheckFailure`] per violated invariant.
    pub fn validate(
        conn: &Connection,
        step: &MigrationStep,
        direction: Direction,
        baseline: &ValidationReport,
        summary: &MutationSummary,
    ) -> ValidationReport {
        match Self::run_checks(conn, step, direction, baseline, summary) {
            Ok(report) => {
                if report.passed() {
                    info!(step = %step.id, tables = report.row_counts.len(), "post-migration validation passed");
                } else {
                    for failure in &report.violations {
                        warn!(step = %step.id, %failure, "post-migration check failed");
                    }
                }
                report
            }
            Err(e) => {
                warn!(step = %step.id, error = %e, "validator could not run; treating as failure");
                ValidationReport {
                    captured_at: Utc::now(),
                    row_counts: BTreeMap::new(),
                    index_counts: BTreeMap::new(),
                    orphan_counts: BTreeMap::new(),
                    foreign_key_violations: 0,
                    schema_objects: BTreeMap::new(),
                    violations: vec![CheckFailure {
                        check: CheckKind::ValidatorError,
                        subject: step.id.clone(),
                        expected: "validator completes".to_string(),
                        observed: e.to_string(),
                    }],
                }
            }
        }
    }

    /// Convert a report into `Ok` or a `ValidationFailure`.
    pub fn into_result(step: &str, report: &ValidationReport) -> Result<(), MigrationError> {
        if report.passed() {
            Ok(())
        } else {
            Err(MigrationError::ValidationFailure {
                step: step.to_string(),
                failures: report.violations.iter().map(ToString::to_string).collect(),
            })
        }
    }

    fn run_checks(
        conn: &Connection,
        step: &MigrationStep,
        direction: Direction,
        baseline: &ValidationReport,
        summary: &MutationSummary,
    ) -> Result<ValidationReport, MigrationError> {
        let (ops, orphan_checks): (&[Operation], &[OrphanCheck]) = match direction {
            Direction::Forward => (step.forward.as_slice(), step.expects.no_orphans.as_slice()),
            Direction::Reverse => (step.reverse.as_slice(), &[]),
        };
        let mut report = ValidationReport::capture_with_orphans(conn, orphan_checks)?;
        let mut failures = Vec::new();

        // (a) created tables exist
        let mut expected_tables: BTreeSet<String> =
            MigrationStep::created_tables(ops).into_iter().collect();
        if direction == Direction::Forward {
            expected_tables.extend(step.expects.tables.iter().cloned());
        }
        for table in &expected_tables {
            if !table_exists(conn, table)? {
                failures.push(failure(CheckKind::TableCreated, table, "present", "missing"));
            }
        }

        // (b) removed columns are absent
        let mut removed: BTreeSet<(String, String)> = summary
            .rebuilds
            .iter()
            .flat_map(|r| r.removed_columns.iter().map(|c| (r.table.clone(), c.clone())))
            .collect();
        if direction == Direction::Forward {
            removed.extend(step.expects.removed_columns.iter().cloned());
        }
        for (table, column) in &removed {
            if column_exists(conn, table, column)? {
                failures.push(failure(
                    CheckKind::ColumnRemoved,
                    &format!("{table}.{column}"),
                    "absent",
                    "present",
                ));
            }
        }

        // (c) untouched tables keep their row counts
        let touched = MigrationStep::touched_by(ops);
        for (table, before) in &baseline.row_counts {
            if touched.contains(table) || table.as_str() == LEDGER_TABLE {
                continue;
            }
            let after = report.rows(table);
            if after != Some(*before) {
                failures.push(failure(
                    CheckKind::UntouchedRowCount,
                    table,
                    &before.to_string(),
                    &after.map_or_else(|| "missing".to_string(), |n| n.to_string()),
                ));
            }
        }

        // (d) preserved tables keep their row counts
        let mut preserved: BTreeSet<String> = BTreeSet::new();
        for rebuild in &summary.rebuilds {
            preserved.insert(rebuild.table.clone());
            preserved.extend(rebuild.dependents.iter().map(|(t, _)| t.clone()));
        }
        if direction == Direction::Forward {
            preserved.extend(step.expects.preserved.iter().cloned());
        }
        for table in &preserved {
            let before = baseline.rows(table);
            let after = report.rows(table);
            if before != after {
                failures.push(failure(
                    CheckKind::PreservedRowCount,
                    table,
                    &before.map_or_else(|| "missing".to_string(), |n| n.to_string()),
                    &after.map_or_else(|| "missing".to_string(), |n| n.to_string()),
                ));
            }
        }

        // (e) foreign keys
        if report.foreign_key_violations != 0 {
            failures.push(failure(
                CheckKind::ForeignKeys,
                "foreign_key_check",
                "0",
                &report.foreign_key_violations.to_string(),
            ));
        }

        // (f) orphans
        for check in orphan_checks {
            match report.orphan_counts.get(&check.label()).copied() {
                Some(0) => {}
                Some(n) => failures.push(failure(CheckKind::Orphans, &check.label(), "0", &n.to_string())),
                None => failures.push(failure(
                    CheckKind::Orphans,
                    &check.label(),
                    "0",
                    "tables missing",
                )),
            }
        }

        // (g) indexes, triggers and views survive unless declared dropped
        let mut declared: BTreeSet<&str> = summary
            .rebuilds
            .iter()
            .flat_map(|r| r.dropped_objects.iter().map(String::as_str))
            .collect();
        let mut dropped_tables: BTreeSet<&str> = BTreeSet::new();
        for op in ops {
            match op {
                Operation::DropIndex { name } | Operation::DropView { name } => {
                    declared.insert(name);
                }
                Operation::DropTable { name } => {
                    dropped_tables.insert(name);
                }
                _ => {}
            }
        }
        for (object, owner) in &baseline.schema_objects {
            if report.schema_objects.contains_key(object)
                || declared.contains(object.as_str())
                || dropped_tables.contains(owner.as_str())
            {
                continue;
            }
            failures.push(failure(CheckKind::DependentObject, object, "present", "missing"));
        }

        report.violations = failures;
        Ok(report)
    }
}

fn failure(check: CheckKind, subject: &str, expected: &str, observed: &str) -> CheckFailure {
    CheckFailure {
        check,
        subject: subject.to_string(),
        expected: expected.to_string(),
        observed: observed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::mutator::SchemaMutator;
    use crate::migration::repair::MembershipTable;
    use crate::migration::step::RebuildSpec;
    use crate::schema::{ColumnDef, TableDef};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE leagues (id TEXT PRIMARY KEY, name TEXT NOT NULL);
            CREATE TABLE teams (id TEXT PRIMARY KEY, name TEXT NOT NULL, league_id TEXT);
            CREATE TABLE team_league_memberships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team_id TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
                league_id TEXT NOT NULL REFERENCES leagues(id) ON DELETE CASCADE,
                season INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );
            INSERT INTO leagues VALUES ('l1', 'AFC');
            INSERT INTO teams VALUES ('t1', 'Ravens', 'l1'), ('t2', 'Steelers', 'l1');
            INSERT INTO team_league_memberships (team_id, league_id, season) VALUES ('t1', 'l1', 2024);
            "#,
        )
        .unwrap();
        conn
    }

    fn drop_league_step() -> MigrationStep {
        MigrationStep::new("007", Some("006"), "drop teams.league_id")
            .forward(Operation::RebuildTable(RebuildSpec::new(
                TableDef::new("teams")
                    .column(ColumnDef::text_key("id"))
                    .column(ColumnDef::new("name", "TEXT").with("NOT NULL")),
            )))
            .expects_removed("teams", "league_id")
            .expects_preserved("teams")
    }

    #[test]
    fn test_rebuild_passes() {
        let mut conn = conn();
        let step = drop_league_step();
        let baseline = ValidationReport::capture(&conn).unwrap();
        let summary = SchemaMutator::apply(&mut conn, &step, Direction::Forward).unwrap();

        let report = PostMigrationValidator::validate(&conn, &step, Direction::Forward, &baseline, &summary);
        assert!(report.passed(), "{:?}", report.violations);
        assert!(PostMigrationValidator::into_result(&step.id, &report).is_ok());
    }

    #[test]
    fn test_untouched_table_change_fails() {
        let mut conn = conn();
        let step = drop_league_step();
        let baseline = ValidationReport::capture(&conn).unwrap();
        let summary = SchemaMutator::apply(&mut conn, &step, Direction::Forward).unwrap();
        conn.execute("DELETE FROM leagues", []).unwrap();

        let report = PostMigrationValidator::validate(&conn, &step, Direction::Forward, &baseline, &summary);
        assert!(report
            .violations
            .iter()
            .any(|f| f.check == CheckKind::UntouchedRowCount && f.subject == "leagues"));
        // Deleting the league cascaded, or left dangling rows; either way
        // the membership count or the foreign-key scan must also flag it.
        assert!(report.violations.len() >= 2);
        assert!(matches!(
            PostMigrationValidator::into_result(&step.id, &report),
            Err(MigrationError::ValidationFailure { .. })
        ));
    }

    #[test]
    fn test_orphans_and_missing_tables_fail() {
        let conn = conn();
        let baseline = ValidationReport::capture(&conn).unwrap();
        let step = MigrationStep::new("008", Some("007"), "repair")
            .forward(Operation::CreateTable(TableDef::new("never_created").column(ColumnDef::text_key("id"))))
            .expects_no_orphans(OrphanCheck {
                entity_table: "teams".to_string(),
                membership: MembershipTable::new("team_league_memberships", "team_id", "league_id"),
                season: Some(2024),
            });

        let report = PostMigrationValidator::validate(
            &conn,
            &step,
            Direction::Forward,
            &baseline,
            &MutationSummary::default(),
        );
        let kinds: Vec<CheckKind> = report.violations.iter().map(|f| f.check).collect();
        assert!(kinds.contains(&CheckKind::TableCreated));
        assert!(kinds.contains(&CheckKind::Orphans));
        let orphans = report.violations.iter().find(|f| f.check == CheckKind::Orphans).unwrap();
        assert_eq!(orphans.observed, "1");
    }

    #[test]
    fn test_view_lost_in_rebuild_fails() {
        let mut conn = conn();
        conn.execute_batch(
            "CREATE VIEW team_leagues AS \
             SELECT t.name, m.league_id FROM teams t \
             JOIN team_league_memberships m ON m.team_id = t.id;",
        )
        .unwrap();
        let step = drop_league_step();
        let baseline = ValidationReport::capture(&conn).unwrap();
        let summary = SchemaMutator::apply(&mut conn, &step, Direction::Forward).unwrap();

        // `m.league_id` belongs to the membership table, so the view survives.
        assert!(summary.rebuilds[0].dropped_objects.is_empty());
        let report = PostMigrationValidator::validate(&conn, &step, Direction::Forward, &baseline, &summary);
        assert!(report.passed(), "{:?}", report.violations);
        assert_eq!(report.schema_objects["team_leagues"], "team_leagues");

        // Losing it outside the rebuild's accounting is a failure.
        conn.execute_batch("DROP VIEW team_leagues").unwrap();
        let report = PostMigrationValidator::validate(&conn, &step, Direction::Forward, &baseline, &summary);
        let lost: Vec<&CheckFailure> = report
            .violations
            .iter()
            .filter(|f| f.check == CheckKind::DependentObject)
            .collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].subject, "team_leagues");
    }

    #[test]
    fn test_declared_drops_pass() {
        let mut conn = conn();
        conn.execute_batch(
            "CREATE INDEX idx_teams_league_id ON teams(league_id);
             CREATE VIEW team_names AS SELECT name FROM teams;",
        )
        .unwrap();
        let step = drop_league_step().forward(Operation::DropView {
            name: "team_names".to_string(),
        });
        let baseline = ValidationReport::capture(&conn).unwrap();
        let summary = SchemaMutator::apply(&mut conn, &step, Direction::Forward).unwrap();

        assert_eq!(summary.rebuilds[0].dropped_objects, vec!["idx_teams_league_id"]);
        let report = PostMigrationValidator::validate(&conn, &step, Direction::Forward, &baseline, &summary);
        assert!(report.passed(), "{:?}", report.violations);
    }

    #[test]
    fn test_validator_error_fails_closed() {
        let conn = conn();
        let baseline = ValidationReport::capture(&conn).unwrap();
        let step = MigrationStep::new("008", Some("007"), "repair").expects_no_orphans(OrphanCheck {
            entity_table: "teams".to_string(),
            membership: MembershipTable::new("team_league_memberships", "no_such_column", "league_id"),
            season: None,
        });

        let report = PostMigrationValidator::validate(
            &conn,
            &step,
            Direction::Forward,
            &baseline,
            &MutationSummary::default(),
        );
        assert!(!report.passed());
        assert_eq!(report.violations[0].check, CheckKind::ValidatorError);
    }
}
