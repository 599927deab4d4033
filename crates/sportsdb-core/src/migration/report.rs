//! Validation reports: named counters captured before and after a step.

use super::repair::count_orphans;
use super::step::OrphanCheck;
use crate::schema::introspect::{
    foreign_key_violations, list_indexes, list_schema_objects, list_tables, row_count,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which post-migration check produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// A table the step should have created is missing.
    TableCreated,
    /// A column the step should have removed is still present.
    ColumnRemoved,
    /// A table outside the step's scope changed row count.
    UntouchedRowCount,
    /// A table preserved across a rebuild changed row count.
    PreservedRowCount,
    /// The foreign-key scan found violations.
    ForeignKeys,
    /// Entities without an active membership remain.
    Orphans,
    /// An index, trigger or view disappeared without being declared dropped.
    DependentObject,
    /// The validator itself could not run.
    ValidatorError,
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::TableCreated => write!(f, "table_created"),
            CheckKind::ColumnRemoved => write!(f, "column_removed"),
            CheckKind::UntouchedRowCount => write!(f, "untouched_row_count"),
            CheckKind::PreservedRowCount => write!(f, "preserved_row_count"),
            CheckKind::ForeignKeys => write!(f, "foreign_keys"),
            CheckKind::Orphans => write!(f, "orphans"),
            CheckKind::DependentObject => write!(f, "dependent_object"),
            CheckKind::ValidatorError => write!(f, "validator_error"),
        }
    }
}

/// A failed check with observed and expected values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    /// The check that failed.
    pub check: CheckKind,
    /// Table, column or counter the check looked at.
    pub subject: String,
    /// Expected value.
    pub expected: String,
    /// Observed value.
    pub observed: String,
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} on {}: expected {}, observed {}",
            self.check, self.subject, self.expected, self.observed
        )
    }
}

/// Named counters plus violated invariants, captured at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// When the report was captured.
    pub captured_at: DateTime<Utc>,
    /// Row count per user table.
    pub row_counts: BTreeMap<String, i64>,
    /// Explicit index count per user table.
    pub index_counts: BTreeMap<String, i64>,
    /// Orphan count per orphan check label.
    pub orphan_counts: BTreeMap<String, i64>,
    /// Rows reported by the foreign-key scan.
    pub foreign_key_violations: i64,
    /// Owning table of every explicit index, trigger and view.
    #[serde(default)]
    pub schema_objects: BTreeMap<String, String>,
    /// Invariants found violated.
    pub violations: Vec<CheckFailure>,
}

impl ValidationReport {
    /// Capture row, index and foreign-key counters for every user table.
    pub fn capture(conn: &Connection) -> rusqlite::Result<Self> {
        let mut row_counts = BTreeMap::new();
        let mut index_counts = BTreeMap::new();
        for table in list_tables(conn)? {
            row_counts.insert(table.clone(), row_count(conn, &table)?);
            index_counts.insert(table.clone(), list_indexes(conn, &table)?.len() as i64);
        }

        let schema_objects = list_schema_objects(conn)?
            .into_iter()
            .map(|object| (object.name, object.table))
            .collect();

        Ok(Self {
            captured_at: Utc::now(),
            row_counts,
            index_counts,
            orphan_counts: BTreeMap::new(),
            foreign_key_violations: foreign_key_violations(conn)?.len() as i64,
            schema_objects,
            violations: Vec::new(),
        })
    }

    /// Capture counters and run the given orphan scans. Scans whose tables
    /// do not exist yet are skipped.
    pub fn capture_with_orphans(conn: &Connection, checks: &[OrphanCheck]) -> rusqlite::Result<Self> {
        let mut report = Self::capture(conn)?;
        for check in checks {
            if report.row_counts.contains_key(&check.entity_table)
                && report.row_counts.contains_key(&check.membership.table)
            {
                let count = count_orphans(conn, &check.entity_table, &check.membership, check.season)?;
                report.orphan_counts.insert(check.label(), count);
            }
        }
        Ok(report)
    }

    /// Row count for a table, if it existed when captured.
    pub fn rows(&self, table: &str) -> Option<i64> {
        self.row_counts.get(table).copied()
    }

    /// Whether no invariant was violated.
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Tables whose row count differs between `self` (before) and `after`,
    /// as `(table, before, after)`. Tables missing on one side count as -1.
    pub fn row_deltas(&self, after: &ValidationReport) -> Vec<(String, i64, i64)> {
        let mut tables: Vec<&String> = self.row_counts.keys().chain(after.row_counts.keys()).collect();
        tables.sort();
        tables.dedup();
        tables
            .into_iter()
            .filter_map(|table| {
                let before = self.rows(table).unwrap_or(-1);
                let now = after.rows(table).unwrap_or(-1);
                (before != now).then(|| (table.clone(), before, now))
            })
            .collect()
    }
}
