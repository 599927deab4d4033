//! The table rebuild pattern.
//!
//! SQLite cannot drop or rename a constrained column in place, so a table is
//! rebuilt: a new table with the target shape is created, rows are copied
//! with explicit column lists, the old table is dropped and the new one is
//! renamed into place. Indexes, triggers and dependent views are captured
//! beforehand and recreated afterwards.
//!
//! Each object is recreated inside a savepoint and compiled against the new
//! table. Only an object that fails with "no such column", or a view that
//! selects from one, is left dropped; any other failure aborts the rebuild.
//!
//! Must run inside a transaction with foreign-key enforcement switched off;
//! see [`SchemaMutator`](super::mutator::SchemaMutator).

use super::error::MigrationError;
use super::step::RebuildSpec;
use crate::schema::introspect::{list_indexes, list_triggers, list_views};
use crate::schema::{
    columns, dependent_tables, mentions_identifier, quote_ident, row_count, table_exists,
    touch_trigger_sql, StoredObject,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Suffix of the scratch table a rebuild copies into.
pub const REBUILD_SUFFIX: &str = "__rebuild";

const RECREATE_SAVEPOINT: &str = "rebuild_recreate";

/// What a rebuild did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    /// Rebuilt table.
    pub table: String,
    /// Rows carried over.
    pub rows: i64,
    /// Columns present before and absent after.
    pub removed_columns: Vec<String>,
    /// Dependent tables and their (unchanged) row counts.
    pub dependents: Vec<(String, i64)>,
    /// Indexes recreated, including new ones.
    pub indexes_recreated: usize,
    /// Triggers recreated.
    pub triggers_recreated: usize,
    /// Views dropped and recreated.
    pub views_recreated: usize,
    /// Objects that referenced a removed column and were not recreated.
    pub dropped_objects: Vec<String>,
}

/// What happened when a captured object was replayed.
enum Recreated {
    Created,
    /// The object names a column the table no longer has.
    MissingColumn(String),
    /// The object names a table or view that does not exist.
    MissingTable(String),
}

/// A column of the new table and where its values come from.
struct CopyColumn {
    target: String,
    source: String,
}

/// Rebuild a table into the shape given by `spec.definition`.
pub fn rebuild_table(
    conn: &Connection,
    step: &str,
    spec: &RebuildSpec,
) -> Result<RebuildSummary, MigrationError> {
    let table = spec.definition.name.as_str();
    if !table_exists(conn, table)? {
        return Err(MigrationError::MutationFailure {
            step: step.to_string(),
            message: format!("cannot rebuild {table}: table does not exist"),
        });
    }

    let old_columns: Vec<String> = columns(conn, table)?.into_iter().map(|c| c.name).collect();
    let copy = plan_copy(&old_columns, spec);
    let removed_columns: Vec<String> = old_columns
        .iter()
        .filter(|name| !copy.iter().any(|c| c.source.eq_ignore_ascii_case(name)))
        .cloned()
        .collect();

    let indexes = list_indexes(conn, table)?;
    let triggers = list_triggers(conn, table)?;
    let views = dependent_views(conn, table)?;
    let mut dependents = Vec::new();
    for dependent in dependent_tables(conn, table)? {
        let rows = row_count(conn, &dependent)?;
        dependents.push((dependent, rows));
    }
    let before = row_count(conn, table)?;

    info!(
        step,
        table,
        rows = before,
        removed = ?removed_columns,
        indexes = indexes.len(),
        triggers = triggers.len(),
        views = views.len(),
        "rebuilding table"
    );

    let scratch = format!("{table}{REBUILD_SUFFIX}");
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&scratch)))?;
    conn.execute_batch(&spec.definition.create_sql_named(&scratch, false))?;

    let targets: Vec<String> = copy.iter().map(|c| quote_ident(&c.target)).collect();
    let sources: Vec<String> = copy.iter().map(|c| quote_ident(&c.source)).collect();
    let copied = conn.execute(
        &format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_ident(&scratch),
            targets.join(", "),
            sources.join(", "),
            quote_ident(table)
        ),
        [],
    )? as i64;

    let after_copy = row_count(conn, &scratch)?;
    if copied != before || after_copy != before {
        return Err(MigrationError::IntegrityViolation {
            table: table.to_string(),
            message: format!("copied {after_copy} of {before} rows into {scratch}"),
        });
    }
    debug!(table, rows = copied, "rows copied");

    for view in &views {
        conn.execute_batch(&format!("DROP VIEW IF EXISTS {}", quote_ident(&view.name)))?;
    }
    conn.execute_batch(&format!("DROP TABLE {}", quote_ident(table)))?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&scratch),
        quote_ident(table)
    ))?;

    let mut summary = RebuildSummary {
        table: table.to_string(),
        rows: before,
        removed_columns,
        dependents: dependents.clone(),
        ..RebuildSummary::default()
    };

    for index in &indexes {
        match recreate(conn, &index.sql, &[])? {
            Recreated::Created => summary.indexes_recreated += 1,
            Recreated::MissingColumn(reason) => drop_object(&mut summary, index, &reason),
            Recreated::MissingTable(reason) => return Err(unrecreatable(step, index, reason)),
        }
    }
    for index in &spec.indexes {
        conn.execute_batch(&index.create_sql())?;
        summary.indexes_recreated += 1;
    }

    // Trigger bodies are only resolved when a statement that fires them is
    // compiled.
    let new_columns: Vec<String> = columns(conn, table)?.into_iter().map(|c| c.name).collect();
    let firing = firing_statements(table, &new_columns);
    for trigger in &triggers {
        match recreate(conn, &trigger.sql, &firing)? {
            Recreated::Created => summary.triggers_recreated += 1,
            Recreated::MissingColumn(reason) => drop_object(&mut summary, trigger, &reason),
            Recreated::MissingTable(reason) => return Err(unrecreatable(step, trigger, reason)),
        }
    }
    if spec.definition.has_column("updated_at") {
        conn.execute_batch(&touch_trigger_sql(table))?;
    }

    recreate_views(conn, step, &views, &mut summary)?;

    let after = row_count(conn, table)?;
    if after != before {
        return Err(MigrationError::IntegrityViolation {
            table: table.to_string(),
            message: format!("row count changed from {before} to {after}"),
        });
    }
    for (dependent, rows) in &dependents {
        let now = row_count(conn, dependent)?;
        if now != *rows {
            return Err(MigrationError::IntegrityViolation {
                table: dependent.clone(),
                message: format!(
                    "dependent of {table} changed from {rows} to {now} rows during rebuild"
                ),
            });
        }
    }

    info!(
        table,
        rows = after,
        indexes = summary.indexes_recreated,
        triggers = summary.triggers_recreated,
        views = summary.views_recreated,
        "table rebuilt"
    );
    Ok(summary)
}

/// Map each target column to its source: an explicit rename, or the column
/// of the same name. Target columns with no source take their default.
fn plan_copy(old_columns: &[String], spec: &RebuildSpec) -> Vec<CopyColumn> {
    spec.definition
        .columns
        .iter()
        .filter_map(|target| {
            let renamed = spec
                .renames
                .iter()
                .find(|r| r.to.eq_ignore_ascii_case(&target.name))
                .map(|r| r.from.as_str());
            let source = renamed.unwrap_or(target.name.as_str());
            old_columns
                .iter()
                .find(|old| old.eq_ignore_ascii_case(source))
                .map(|old| CopyColumn {
                    target: target.name.clone(),
                    source: old.clone(),
                })
        })
        .collect()
}

/// Views selecting from `table`, directly or through other such views.
/// All of them must be gone before the rename re-parses the schema.
fn dependent_views(conn: &Connection, table: &str) -> Result<Vec<StoredObject>, MigrationError> {
    let mut views = Vec::new();
    let mut names = vec![table.to_string()];
    let mut others = list_views(conn)?;
    loop {
        let (hit, rest): (Vec<StoredObject>, Vec<StoredObject>) = others
            .into_iter()
            .partition(|v| names.iter().any(|name| mentions_identifier(&v.sql, name)));
        if hit.is_empty() {
            return Ok(views);
        }
        names.extend(hit.iter().map(|v| v.name.clone()));
        views.extend(hit);
        others = rest;
    }
}

/// Views may select from each other, so a view blocked on a missing table
/// is retried once the others are back. Views still blocked after a pass
/// without progress depend on a view left dropped.
fn recreate_views(
    conn: &Connection,
    step: &str,
    views: &[StoredObject],
    summary: &mut RebuildSummary,
) -> Result<(), MigrationError> {
    let mut pending: Vec<&StoredObject> = views.iter().collect();
    while !pending.is_empty() {
        let attempted = pending.len();
        let mut blocked = Vec::new();
        for view in pending {
            let check = format!("SELECT * FROM {}", quote_ident(&view.name));
            match recreate(conn, &view.sql, &[check])? {
                Recreated::Created => summary.views_recreated += 1,
                Recreated::MissingColumn(reason) => drop_object(summary, view, &reason),
                Recreated::MissingTable(reason) => blocked.push((view, reason)),
            }
        }

        if blocked.len() == attempted {
            if summary.dropped_objects.is_empty() {
                let (view, reason) = blocked.swap_remove(0);
                return Err(unrecreatable(step, view, reason));
            }
            for (view, reason) in blocked {
                drop_object(summary, view, &reason);
            }
            break;
        }
        pending = blocked.into_iter().map(|(view, _)| view).collect();
    }
    Ok(())
}

/// Replay `sql` in a savepoint and compile each of `checks` against the
/// result. A missing column or table undoes the object and is reported;
/// any other error is returned.
fn recreate(conn: &Connection, sql: &str, checks: &[String]) -> Result<Recreated, MigrationError> {
    conn.execute_batch(&format!("SAVEPOINT {RECREATE_SAVEPOINT}"))?;
    let attempt = conn.execute_batch(sql).and_then(|()| {
        checks
            .iter()
            .try_for_each(|check| conn.prepare(check).map(drop))
    });

    match attempt {
        Ok(()) => {
            conn.execute_batch(&format!("RELEASE {RECREATE_SAVEPOINT}"))?;
            Ok(Recreated::Created)
        }
        Err(e) => {
            conn.execute_batch(&format!(
                "ROLLBACK TO {RECREATE_SAVEPOINT}; RELEASE {RECREATE_SAVEPOINT}"
            ))?;
            match missing_reference(&e) {
                Some(Missing::Column) => Ok(Recreated::MissingColumn(e.to_string())),
                Some(Missing::Table) => Ok(Recreated::MissingTable(e.to_string())),
                None => Err(e.into()),
            }
        }
    }
}

enum Missing {
    Column,
    Table,
}

fn missing_reference(err: &rusqlite::Error) -> Option<Missing> {
    let rusqlite::Error::SqliteFailure(_, Some(message)) = err else {
        return None;
    };
    if message.starts_with("no such column") || message.contains("has no column named") {
        Some(Missing::Column)
    } else if message.starts_with("no such table") {
        Some(Missing::Table)
    } else {
        None
    }
}

/// Statements that compile every trigger on `table`. Prepared, never run.
fn firing_statements(table: &str, columns: &[String]) -> Vec<String> {
    let table = quote_ident(table);
    let assignments: Vec<String> = columns
        .iter()
        .map(|c| format!("{0} = {0}", quote_ident(c)))
        .collect();
    let mut statements = vec![
        format!("INSERT INTO {table} DEFAULT VALUES"),
        format!("DELETE FROM {table}"),
    ];
    if !assignments.is_empty() {
        statements.push(format!("UPDATE {table} SET {}", assignments.join(", ")));
    }
    statements
}

fn drop_object(summary: &mut RebuildSummary, object: &StoredObject, reason: &str) {
    warn!(
        table = %summary.table,
        object = %object.name,
        reason,
        "object references a removed column, not recreated"
    );
    summary.dropped_objects.push(object.name.clone());
}

fn unrecreatable(step: &str, object: &StoredObject, reason: String) -> MigrationError {
    MigrationError::MutationFailure {
        step: step.to_string(),
        message: format!("cannot recreate {} after rebuild: {reason}", object.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::introspect::{index_columns, trigger_exists};
    use crate::schema::{
        column_exists, index_exists, touch_trigger_name, view_exists, ColumnDef, TableDef,
    };

    fn teams_without_league() -> TableDef {
        TableDef::new("teams")
            .column(ColumnDef::text_key("id"))
            .column(ColumnDef::new("name", "TEXT").with("NOT NULL"))
            .column(ColumnDef::new("market", "TEXT"))
            .timestamps()
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::set_foreign_keys(&conn, false).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE teams (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                market TEXT,
                league_id TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX idx_teams_name ON teams(name);
            CREATE INDEX idx_teams_league_id ON teams(league_id);
            CREATE TABLE games (
                id TEXT PRIMARY KEY,
                home_team_id TEXT REFERENCES teams(id) ON DELETE CASCADE
            );
            CREATE VIEW team_names AS SELECT id, name FROM teams;
            CREATE VIEW team_leagues AS SELECT id, league_id FROM teams;
            "#,
        )
        .unwrap();
        for i in 0..50 {
            conn.execute(
                "INSERT INTO teams (id, name, market, league_id) VALUES (?1, ?2, 'City', 'l1')",
                rusqlite::params![format!("t{i:02}"), format!("Team {i}")],
            )
            .unwrap();
        }
        conn.execute_batch("INSERT INTO games VALUES ('g1', 't01'), ('g2', 't02');")
            .unwrap();
        conn
    }

    #[test]
    fn test_rebuild_drops_column_and_keeps_rows() {
        let conn = conn();
        let ids_before: Vec<String> = conn
            .prepare("SELECT id FROM teams ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        let summary =
            rebuild_table(&conn, "007", &RebuildSpec::new(teams_without_league())).unwrap();

        assert_eq!(summary.rows, 50);
        assert_eq!(summary.removed_columns, vec!["league_id"]);
        assert_eq!(summary.dependents, vec![("games".to_string(), 2)]);
        assert!(!column_exists(&conn, "teams", "league_id").unwrap());
        assert!(!table_exists(&conn, "teams__rebuild").unwrap());

        let ids_after: Vec<String> = conn
            .prepare("SELECT id FROM teams ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids_before, ids_after);

        assert!(index_exists(&conn, "idx_teams_name").unwrap());
        assert_eq!(index_columns(&conn, "idx_teams_name").unwrap(), vec!["name"]);
        assert!(!index_exists(&conn, "idx_teams_league_id").unwrap());
        assert!(view_exists(&conn, "team_names").unwrap());
        assert!(!view_exists(&conn, "team_leagues").unwrap());
        assert!(trigger_exists(&conn, &touch_trigger_name("teams")).unwrap());
        assert_eq!(summary.views_recreated, 1);
    }

    #[test]
    fn test_rebuild_renames_column() {
        let conn = conn();
        let definition = TableDef::new("teams")
            .column(ColumnDef::text_key("id"))
            .column(ColumnDef::new("display_name", "TEXT").with("NOT NULL"))
            .column(ColumnDef::new("market", "TEXT"));
        let spec = RebuildSpec::new(definition)
            .rename("name", "display_name")
            .index(crate::schema::IndexDef::on("teams", &["display_name"]));

        let summary = rebuild_table(&conn, "rename", &spec).unwrap();
        assert_eq!(summary.rows, 50);
        let name: String = conn
            .query_row("SELECT display_name FROM teams WHERE id = 't07'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Team 7");
        assert!(index_exists(&conn, "idx_teams_display_name").unwrap());
        // The old name index and the view both select `name`.
        assert!(summary.dropped_objects.contains(&"idx_teams_name".to_string()));
        assert!(summary.dropped_objects.contains(&"team_names".to_string()));
    }

    #[test]
    fn test_view_joining_same_named_column_survives() {
        let conn = conn();
        conn.execute_batch(
            r#"
            CREATE TABLE team_league_memberships (
                team_id TEXT NOT NULL REFERENCES teams(id),
                league_id TEXT NOT NULL
            );
            INSERT INTO team_league_memberships VALUES ('t01', 'l1'), ('t02', 'l1');
            CREATE VIEW team_memberships AS
                SELECT t.name, m.league_id FROM teams t
                JOIN team_league_memberships m ON m.team_id = t.id;
            CREATE VIEW team_membership_count AS SELECT count(*) AS n FROM team_memberships;
            "#,
        )
        .unwrap();

        let summary =
            rebuild_table(&conn, "007", &RebuildSpec::new(teams_without_league())).unwrap();

        assert_eq!(summary.dropped_objects, vec!["idx_teams_league_id", "team_leagues"]);
        assert!(view_exists(&conn, "team_memberships").unwrap());
        assert!(view_exists(&conn, "team_membership_count").unwrap());
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM team_memberships", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_trigger_on_removed_column_is_dropped() {
        let conn = conn();
        conn.execute_batch(
            r#"
            CREATE TABLE league_changes (team_id TEXT, league_id TEXT);
            CREATE TRIGGER trg_teams_league_change AFTER UPDATE ON teams
            BEGIN
                INSERT INTO league_changes VALUES (NEW.id, NEW.league_id);
            END;
            CREATE TRIGGER trg_teams_name_audit AFTER UPDATE ON teams
            BEGIN
                INSERT INTO league_changes (team_id) VALUES (NEW.id);
            END;
            "#,
        )
        .unwrap();

        let summary =
            rebuild_table(&conn, "007", &RebuildSpec::new(teams_without_league())).unwrap();

        assert!(summary.dropped_objects.contains(&"trg_teams_league_change".to_string()));
        assert!(!trigger_exists(&conn, "trg_teams_league_change").unwrap());
        assert!(trigger_exists(&conn, "trg_teams_name_audit").unwrap());
        assert_eq!(summary.triggers_recreated, 1);
    }

    #[test]
    fn test_failing_copy_reports_error() {
        let conn = conn();
        let definition = teams_without_league().constraint("CHECK (CAST(substr(id, 2) AS INTEGER) < 10)");
        let result = rebuild_table(&conn, "007", &RebuildSpec::new(definition));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_table_is_mutation_failure() {
        let conn = Connection::open_in_memory().unwrap();
        let result = rebuild_table(&conn, "007", &RebuildSpec::new(teams_without_league()));
        assert!(matches!(result, Err(MigrationError::MutationFailure { .. })));
    }
}
