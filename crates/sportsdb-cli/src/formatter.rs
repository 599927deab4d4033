//! Output formatting for run summaries, status and reports.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use sportsdb::sportsdb_backup::BackupHandle;
use sportsdb::sportsdb_core::ValidationReport;
use sportsdb::{RunArtifact, StepStatus};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Per-step outcome, totals, warnings and errors of a run.
pub fn format_run(artifact: &RunArtifact) -> String {
    let info = &artifact.migration_info;
    let mut output = String::new();

    if info.steps.is_empty() {
        output.push_str("Nothing to do: database is up to date\n");
    } else {
        let mut table = Table::new();
        table.set_header(vec!["Step", "Direction", "State", "Backup", "Error"]);
        for step in &info.steps {
            let state = if step.skipped {
                "ALREADY APPLIED".to_string()
            } else {
                step.state.to_string()
            };
            table.add_row(vec![
                Cell::new(&step.id),
                Cell::new(step.direction),
                Cell::new(state),
                Cell::new(
                    step.backup
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                ),
                Cell::new(step.error.as_deref().unwrap_or("")),
            ]);
        }
        output.push_str(&table.to_string());
        output.push('\n');
    }

    let totals = artifact.totals();
    let mut counts = Table::new();
    counts.set_header(vec!["Summary", "Count"]);
    for (label, value) in [
        ("tables created", totals.tables_created),
        ("columns added", totals.columns_added),
        ("enums created", totals.enums_created),
        ("indexes created", totals.indexes_created),
        ("tables rebuilt", totals.tables_rebuilt),
        ("rows seeded", totals.rows_seeded),
        ("rows skipped", totals.rows_skipped),
        ("rows repaired", totals.rows_repaired),
        ("warnings", totals.warnings),
        ("errors", totals.errors),
    ] {
        counts.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    output.push_str(&counts.to_string());
    output.push('\n');

    for warning in &artifact.warnings {
        output.push_str(&format!("warning: {}\n", warning));
    }
    for error in &artifact.errors {
        output.push_str(&format!("error: {}\n", error));
    }

    let mode = if info.dry_run { " (dry run)" } else { "" };
    output.push_str(&format!("Migration {}{}", artifact.migration_status, mode));
    output
}

/// Applied/pending listing.
pub fn format_status(status: &[StepStatus]) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Step", "State", "Applied at", "Description"]);
    for step in status {
        table.add_row(vec![
            Cell::new(&step.id),
            Cell::new(step.state),
            Cell::new(
                step.applied_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_default(),
            ),
            Cell::new(&step.description),
        ]);
    }
    let pending = status
        .iter()
        .filter(|s| s.state != sportsdb::StepState::Applied)
        .count();
    format!("{}\n{} step(s), {} not applied", table, status.len(), pending)
}

/// Row counts, orphan counts and violations of an integrity check.
pub fn format_check(report: &ValidationReport) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Table", "Rows", "Indexes"]);
    for (name, rows) in &report.row_counts {
        let indexes = report.index_counts.get(name).copied().unwrap_or(0);
        table.add_row(vec![Cell::new(name), Cell::new(rows), Cell::new(indexes)]);
    }

    let mut output = format!("{}\n", table);
    output.push_str(&format!(
        "foreign key violations: {}\n",
        report.foreign_key_violations
    ));
    for (label, count) in &report.orphan_counts {
        output.push_str(&format!("orphans {}: {}\n", label, count));
    }
    if report.passed() {
        output.push_str("PASS");
    } else {
        for failure in &report.violations {
            output.push_str(&format!("FAIL {}\n", failure));
        }
        output.push_str(&format!("{} check(s) failed", report.violations.len()));
    }
    output
}

/// Snapshot listing.
pub fn format_backups(handles: &[BackupHandle], verified: Option<&[bool]>) -> String {
    if handles.is_empty() {
        return "No backups".to_string();
    }

    let mut table = Table::new();
    let mut header = vec!["Backup", "Created at", "Bytes", "Compressed", "Checksum", "Source"];
    if verified.is_some() {
        header.push("Verified");
    }
    table.set_header(header);

    for (i, handle) in handles.iter().enumerate() {
        let mut row = vec![
            Cell::new(&handle.id),
            Cell::new(handle.created_at.to_rfc3339()),
            Cell::new(handle.size_bytes),
            Cell::new(if handle.compressed { "yes" } else { "no" }),
            Cell::new(&handle.checksum[..handle.checksum.len().min(12)]),
            Cell::new(handle.source.display()),
        ];
        if let Some(results) = verified {
            let ok = results.get(i).copied().unwrap_or(false);
            row.push(Cell::new(if ok { "ok" } else { "MISMATCH" }));
        }
        table.add_row(row);
    }
    format!("{}\n{} backup(s)", table, handles.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sportsdb::sportsdb_core::Direction;
    use sportsdb::{RunState, StepRecord, StepState};
    use std::path::Path;

    #[test]
    fn test_format_run_lists_steps_and_totals() {
        let mut artifact = RunArtifact::new(Path::new("sports.db"), true);
        let mut record = StepRecord::new("001_reference_tables", Direction::Forward);
        record.advance(RunState::PrereqsChecked);
        artifact.push_step(record);

        let output = format_run(&artifact);
        assert!(output.contains("001_reference_tables"));
        assert!(output.contains("PREREQS_CHECKED"));
        assert!(output.contains("rows repaired"));
        assert!(output.ends_with("Migration completed (dry run)"));
    }

    #[test]
    fn test_format_status_counts_pending() {
        let status = vec![StepStatus {
            id: "001_reference_tables".to_string(),
            description: "reference".to_string(),
            state: StepState::Pending,
            applied_at: None,
        }];
        assert!(format_status(&status).ends_with("1 step(s), 1 not applied"));
    }

    #[test]
    fn test_format_backups_empty() {
        assert_eq!(format_backups(&[], None), "No backups");
    }
}
