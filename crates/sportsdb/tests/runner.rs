//! End-to-end runs against file-backed databases.

use rusqlite::{params, Connection};
use sportsdb::{
    MigrationConfig, MigrationRunner, MigrationStatus, RunArtifact, RunState, StepState,
};
use sportsdb_core::catalog;
use sportsdb_core::migration::{ledger, CheckKind, RebuildSpec};
use sportsdb_core::schema::{column_exists, master_entries, row_count, table_exists};
use sportsdb_core::{
    ColumnDef, IndexDef, MigrationChain, MigrationError, MigrationStep, Operation, TableDef,
};
use std::path::PathBuf;

struct TestContext {
    db: PathBuf,
    dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            db: dir.path().join("sports.db"),
            dir,
        }
    }

    fn config(&self) -> MigrationConfig {
        MigrationConfig::new(&self.db)
    }

    fn runner(&self, chain: MigrationChain) -> MigrationRunner {
        MigrationRunner::with_chain(self.config(), chain)
    }

    fn builtin(&self) -> MigrationRunner {
        MigrationRunner::new(self.config()).unwrap()
    }

    fn conn(&self) -> Connection {
        Connection::open(&self.db).unwrap()
    }

    fn insert_teams(&self, n: i64) {
        let conn = self.conn();
        for seq in 1..=n {
            conn.execute(
                "INSERT INTO teams (id, league_id, seq, name) VALUES (?1, ?2, ?3, ?4)",
                params![format!("team-{seq:02}"), "nfl", seq, format!("Team {seq}")],
            )
            .unwrap();
        }
    }

    fn team_ids(&self) -> Vec<String> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM teams ORDER BY id").unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn applied(&self) -> Vec<String> {
        ledger::applied(&self.conn())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }
}

fn teams(with_league_id: bool) -> TableDef {
    let mut def = TableDef::new("teams").column(ColumnDef::text_key("id"));
    if with_league_id {
        def = def.column(ColumnDef::new("league_id", "TEXT"));
    }
    def.column(ColumnDef::new("seq", "INTEGER").with("NOT NULL"))
        .column(ColumnDef::new("name", "TEXT").with("NOT NULL"))
}

fn create_teams() -> MigrationStep {
    MigrationStep::new("001_teams", None, "create teams")
        .forward(Operation::CreateTable(teams(true)))
        .forward(Operation::CreateIndex(IndexDef::on("teams", &["league_id"])))
        .reverse(Operation::DropTable {
            name: "teams".to_string(),
        })
}

fn drop_league_id(definition: TableDef) -> MigrationStep {
    MigrationStep::new("002_drop_league_id", Some("001_teams"), "drop teams.league_id")
        .requires_column("teams", "league_id")
        .forward(Operation::RebuildTable(RebuildSpec::new(definition)))
        .expects_removed("teams", "league_id")
        .expects_preserved("teams")
        .reverse(Operation::RebuildTable(
            RebuildSpec::new(teams(true)).index(IndexDef::on("teams", &["league_id"])),
        ))
}

fn create_notes() -> MigrationStep {
    MigrationStep::new("003_notes", Some("002_drop_league_id"), "create notes")
        .requires_table("teams")
        .forward(Operation::CreateTable(
            TableDef::new("notes")
                .column(ColumnDef::text_key("id"))
                .column(ColumnDef::new("body", "TEXT")),
        ))
        .reverse(Operation::DropTable {
            name: "notes".to_string(),
        })
}

fn legacy_chain() -> MigrationChain {
    MigrationChain::new(vec![create_teams(), drop_league_id(teams(false)), create_notes()]).unwrap()
}

#[test]
fn test_rebuild_drops_column_and_keeps_rows() {
    let ctx = TestContext::new();
    let runner = ctx.runner(legacy_chain());

    runner.run(Some("001_teams")).into_result().unwrap();
    ctx.insert_teams(50);
    let before = ctx.team_ids();

    let artifact = runner.run(Some("002_drop_league_id")).into_result().unwrap();
    assert_eq!(artifact.migration_info.steps.len(), 1);
    assert_eq!(artifact.migration_info.steps[0].state, RunState::Committed);

    let conn = ctx.conn();
    assert!(!column_exists(&conn, "teams", "league_id").unwrap());
    assert_eq!(row_count(&conn, "teams").unwrap(), 50);
    assert_eq!(ctx.team_ids(), before);
    assert_eq!(ctx.applied(), vec!["001_teams", "002_drop_league_id"]);
}

#[test]
fn test_out_of_order_step_is_refused() {
    let ctx = TestContext::new();
    let runner = ctx.runner(legacy_chain());
    runner.run(Some("001_teams")).into_result().unwrap();

    let outcome = runner.apply_step("003_notes");
    assert!(matches!(outcome.error, Some(MigrationError::ChainOrder { .. })));
    assert_eq!(outcome.artifact.migration_status, MigrationStatus::Failed);
    assert!(!table_exists(&ctx.conn(), "notes").unwrap());
    assert_eq!(ctx.applied(), vec!["001_teams"]);
}

#[test]
fn test_mutation_failure_restores_snapshot() {
    let ctx = TestContext::new();
    // Copying fails once seq passes 10.
    let failing = teams(false).constraint("CHECK (\"seq\" <= 10)");
    let chain = MigrationChain::new(vec![create_teams(), drop_league_id(failing)]).unwrap();
    let runner = ctx.runner(chain);

    runner.run(Some("001_teams")).into_result().unwrap();
    ctx.insert_teams(50);
    let before = ctx.team_ids();

    let outcome = runner.run(None);
    assert!(matches!(outcome.error, Some(MigrationError::MutationFailure { .. })));
    let record = &outcome.artifact.migration_info.steps[0];
    assert_eq!(record.state, RunState::RolledBack);
    assert!(record.backup.as_ref().unwrap().exists());

    let conn = ctx.conn();
    assert!(column_exists(&conn, "teams", "league_id").unwrap());
    assert!(!table_exists(&conn, "teams__rebuild").unwrap());
    assert_eq!(ctx.team_ids(), before);
    assert_eq!(ctx.applied(), vec!["001_teams"]);
}

#[test]
fn test_validation_failure_restores_snapshot() {
    let ctx = TestContext::new();
    // Deletes rows from a table it does not declare as touched.
    let purge = MigrationStep::new("002_purge", Some("001_teams"), "purge").forward(Operation::Execute {
        sql: "DELETE FROM teams WHERE seq > 40".to_string(),
        touches: Vec::new(),
    });
    let runner = ctx.runner(MigrationChain::new(vec![create_teams(), purge]).unwrap());

    runner.run(Some("001_teams")).into_result().unwrap();
    ctx.insert_teams(50);

    let outcome = runner.run(None);
    match &outcome.error {
        Some(MigrationError::ValidationFailure { failures, .. }) => {
            assert!(failures[0].contains("untouched_row_count"), "{failures:?}");
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(outcome.artifact.migration_info.steps[0].state, RunState::RolledBack);
    assert_eq!(row_count(&ctx.conn(), "teams").unwrap(), 50);
    assert_eq!(ctx.applied(), vec!["001_teams"]);
}

#[test]
fn test_unmet_prerequisites_abort_without_backup() {
    let ctx = TestContext::new();
    let needs_rows = MigrationStep::new("002_needs_rows", Some("001_teams"), "needs rows")
        .requires_rows("teams", 1)
        .forward(Operation::Execute {
            sql: "UPDATE teams SET name = upper(name)".to_string(),
            touches: vec!["teams".to_string()],
        });
    let runner = ctx.runner(MigrationChain::new(vec![create_teams(), needs_rows]).unwrap());
    runner.run(Some("001_teams")).into_result().unwrap();
    let backups = runner.backups().list().unwrap().len();

    let outcome = runner.run(None);
    assert!(matches!(outcome.error, Some(MigrationError::PrerequisiteMissing { .. })));
    let record = &outcome.artifact.migration_info.steps[0];
    assert_eq!(record.state, RunState::Aborted);
    assert!(record.backup.is_none());
    assert_eq!(runner.backups().list().unwrap().len(), backups);
}

#[test]
fn test_dry_run_leaves_schema_untouched() {
    let ctx = TestContext::new();
    ctx.builtin()
        .run(Some(catalog::FAN_FEATURES))
        .into_result()
        .unwrap();
    let schema = master_entries(&ctx.conn()).unwrap();

    let dry = MigrationRunner::new(ctx.config().with_dry_run(true)).unwrap();
    let artifact = dry.run(None).into_result().unwrap();

    assert!(artifact.migration_info.dry_run);
    assert_eq!(artifact.migration_info.steps.len(), 4);
    assert!(artifact
        .migration_info
        .steps
        .iter()
        .all(|s| s.state == RunState::PrereqsChecked && s.backup.is_none()));
    assert_eq!(master_entries(&ctx.conn()).unwrap(), schema);
    assert_eq!(ctx.applied().len(), 4);
}

#[test]
fn test_dry_run_does_not_create_database() {
    let ctx = TestContext::new();
    let dry = MigrationRunner::new(ctx.config().with_dry_run(true)).unwrap();
    let artifact = dry.run(None).into_result().unwrap();
    assert_eq!(artifact.migration_info.steps.len(), 8);
    assert!(!ctx.db.exists());
}

#[test]
fn test_dry_run_reports_missing_prerequisites() {
    let ctx = TestContext::new();
    let needs_leagues = MigrationStep::new("002_league_notes", Some("001_teams"), "needs leagues")
        .requires_table("leagues")
        .forward(Operation::AddColumn {
            table: "leagues".to_string(),
            column: ColumnDef::new("notes", "TEXT"),
        });
    let chain = MigrationChain::new(vec![create_teams(), needs_leagues]).unwrap();

    let dry = MigrationRunner::with_chain(ctx.config().with_dry_run(true), chain);
    let outcome = dry.run(None);
    assert!(matches!(outcome.error, Some(MigrationError::PrerequisiteMissing { .. })));
    let steps = &outcome.artifact.migration_info.steps;
    assert_eq!(steps[0].state, RunState::PrereqsChecked);
    assert_eq!(steps[1].state, RunState::Aborted);
    assert!(!ctx.db.exists());
}

#[test]
fn test_builtin_chain_runs_and_reruns() {
    let ctx = TestContext::new();
    let runner = ctx.builtin();

    let first = runner.run(None).into_result().unwrap();
    assert_eq!(first.committed().count(), 8);
    assert_eq!(first.migration_info.backup_paths.len(), 8);
    let totals = first.totals();
    assert!(totals.tables_created >= 18);
    assert_eq!(totals.tables_rebuilt, 1);
    assert_eq!(totals.errors, 0);

    let second = runner.run(None).into_result().unwrap();
    assert!(second.migration_info.steps.is_empty());

    let again = runner.apply_step(catalog::REFERENCE_TABLES).into_result().unwrap();
    assert!(again.migration_info.steps[0].skipped);
    assert_eq!(ctx.applied().len(), 8);
}

#[test]
fn test_status_reports_applied_pending_and_drift() {
    let ctx = TestContext::new();
    let runner = ctx.runner(legacy_chain());
    assert!(runner
        .status()
        .unwrap()
        .iter()
        .all(|s| s.state == StepState::Pending));

    runner.run(Some("001_teams")).into_result().unwrap();
    let status = runner.status().unwrap();
    assert_eq!(status[0].state, StepState::Applied);
    assert!(status[0].applied_at.is_some());
    assert_eq!(status[1].state, StepState::Pending);

    // Redefine the applied step.
    let changed = create_teams().forward(Operation::CreateIndex(IndexDef::on("teams", &["name"])));
    let drifted = ctx.runner(
        MigrationChain::new(vec![changed, drop_league_id(teams(false)), create_notes()]).unwrap(),
    );
    assert_eq!(drifted.status().unwrap()[0].state, StepState::Drifted);
    let outcome = drifted.run(None);
    assert!(matches!(outcome.error, Some(MigrationError::ChecksumMismatch { .. })));
}

#[test]
fn test_revert_applies_reverse_action() {
    let ctx = TestContext::new();
    let runner = ctx.runner(legacy_chain());
    runner.run(Some("001_teams")).into_result().unwrap();
    ctx.insert_teams(20);
    runner.run(None).into_result().unwrap();

    let reverted = runner.revert().into_result().unwrap();
    assert_eq!(reverted.migration_info.steps[0].id, "003_notes");
    assert!(!table_exists(&ctx.conn(), "notes").unwrap());

    runner.revert().into_result().unwrap();
    let conn = ctx.conn();
    assert!(column_exists(&conn, "teams", "league_id").unwrap());
    assert_eq!(row_count(&conn, "teams").unwrap(), 20);
    assert_eq!(ctx.applied(), vec!["001_teams"]);
}

#[test]
fn test_seed_revert_keeps_rows_that_existed_before() {
    let ctx = TestContext::new();
    let runner = ctx.builtin();
    runner.run(Some(catalog::MEMBERSHIPS)).into_result().unwrap();
    ctx.conn()
        .execute_batch(
            "INSERT INTO sports (id, name, slug) VALUES ('football', 'Football', 'football');
             INSERT INTO leagues (id, sport_id, name, abbreviation, slug)
                 VALUES ('nfl', 'football', 'National Football League', 'NFL', 'nfl');",
        )
        .unwrap();

    let applied = runner.run(Some(catalog::REFERENCE_SEEDS)).into_result().unwrap();
    let summary = applied.migration_info.steps[0].summary.as_ref().unwrap();
    assert_eq!(summary.rows_skipped, 2);
    assert!(!summary.seeded_keys["sports"].contains(&"football".to_string()));
    assert_eq!(row_count(&ctx.conn(), "sports").unwrap(), 5);

    let reverted = runner.revert().into_result().unwrap();
    assert_eq!(reverted.migration_info.steps[0].id, catalog::REFERENCE_SEEDS);

    let conn = ctx.conn();
    let ids = |table: &str| -> Vec<String> {
        conn.prepare(&format!("SELECT id FROM {table} ORDER BY id"))
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    };
    assert_eq!(ids("sports"), vec!["football"]);
    assert_eq!(ids("leagues"), vec!["nfl"]);
    assert_eq!(row_count(&conn, "conferences").unwrap(), 0);
    assert_eq!(row_count(&conn, "divisions").unwrap(), 0);
    assert_eq!(ctx.applied().last().map(String::as_str), Some(catalog::MEMBERSHIPS));
}

#[test]
fn test_repair_step_cannot_be_reverted() {
    let ctx = TestContext::new();
    let runner = ctx.builtin();
    runner.run(None).into_result().unwrap();

    let outcome = runner.revert();
    assert!(matches!(outcome.error, Some(MigrationError::ChainOrder { .. })));
    assert_eq!(ctx.applied().len(), 8);
}

#[test]
fn test_results_artifact_is_written() {
    let ctx = TestContext::new();
    let results = ctx.dir.path().join("audit").join("run.json");
    let runner = MigrationRunner::with_chain(ctx.config().with_results_path(&results), legacy_chain());
    runner.run(None).into_result().unwrap();

    let artifact = RunArtifact::read(&results).unwrap();
    assert_eq!(artifact.migration_status, MigrationStatus::Completed);
    assert_eq!(artifact.migration_info.steps.len(), 3);
    assert!(artifact.validation_results.pre_migration.is_some());
    let post = artifact.validation_results.post_migration.unwrap();
    assert_eq!(post.rows("notes"), Some(0));
    assert!(artifact.migration_info.finished_at.is_some());
}

#[test]
fn test_check_reports_orphans() {
    let ctx = TestContext::new();
    let runner = ctx.builtin();
    runner.run(None).into_result().unwrap();
    assert!(runner.check(None).unwrap().passed());

    ctx.conn()
        .execute(
            "INSERT INTO teams (id, sport_id, name, market, slug) VALUES ('x', 'football', 'Nobodies', 'Nowhere', 'x')",
            [],
        )
        .unwrap();
    let report = runner.check(None).unwrap();
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].check, CheckKind::Orphans);
}
