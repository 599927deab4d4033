//! Migration step definitions.
//!
//! A [`MigrationStep`] is an immutable, uniquely identified unit of schema
//! change linked to its predecessor. Its forward and reverse actions are
//! ordered lists of [`Operation`]s; the checksum covers the identity and the
//! forward action, so any edit to an applied step is detected.

use super::repair::{MembershipTable, RepairSpec};
use super::seed::SeedSet;
use crate::schema::{ColumnDef, IndexDef, TableDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A column renamed while rebuilding a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    /// Column name in the old table.
    pub from: String,
    /// Column name in the rebuilt table.
    pub to: String,
}

/// A table rebuild: the definition is the desired final shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSpec {
    /// Target shape; its name is the table being rebuilt.
    pub definition: TableDef,
    /// Columns carried over under a new name.
    pub renames: Vec<ColumnRename>,
    /// Extra indexes to create on the rebuilt table.
    pub indexes: Vec<IndexDef>,
}

impl RebuildSpec {
    /// Rebuild a table into the given shape.
    pub fn new(definition: TableDef) -> Self {
        Self {
            definition,
            renames: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Carry `from` over as `to`.
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.push(ColumnRename {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Create an index after the swap.
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }
}

/// A single schema or data operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// `CREATE TABLE IF NOT EXISTS`.
    CreateTable(TableDef),
    /// Add a column unless it already exists.
    AddColumn {
        /// Target table.
        table: String,
        /// Column to add.
        column: ColumnDef,
    },
    /// Create an enum type as a lookup table holding its values.
    CreateEnum {
        /// Type name (also the lookup table name).
        name: String,
        /// Allowed values.
        values: Vec<String>,
    },
    /// `CREATE INDEX IF NOT EXISTS`.
    CreateIndex(IndexDef),
    /// Create the trigger keeping `updated_at` current.
    CreateTouchTrigger {
        /// Target table.
        table: String,
    },
    /// `CREATE VIEW IF NOT EXISTS`.
    CreateView {
        /// View name.
        name: String,
        /// The `SELECT` the view wraps.
        select: String,
    },
    /// Rebuild a table into a new shape (drop/rename column, drop constraint).
    RebuildTable(RebuildSpec),
    /// Insert reference rows, skipping existing natural keys.
    Seed(SeedSet),
    /// Backfill missing membership rows.
    Repair(RepairSpec),
    /// `DROP TABLE IF EXISTS`.
    DropTable {
        /// Table name.
        name: String,
    },
    /// `DROP INDEX IF EXISTS`.
    DropIndex {
        /// Index name.
        name: String,
    },
    /// `DROP VIEW IF EXISTS`.
    DropView {
        /// View name.
        name: String,
    },
    /// Delete the rows this step's seeds inserted into `table`, by the keys
    /// the ledger recorded when the step was applied.
    DeleteSeeded {
        /// Target table.
        table: String,
    },
    /// A parameterless statement, with the tables whose rows it may change.
    Execute {
        /// SQL text.
        sql: String,
        /// Tables whose row counts may change.
        touches: Vec<String>,
    },
}

impl Operation {
    /// Tables whose contents this operation may change.
    pub fn touched_tables(&self) -> Vec<String> {
        match self {
            Operation::CreateTable(def) => vec![def.name.clone()],
            Operation::AddColumn { table, .. } => vec![table.clone()],
            Operation::CreateEnum { name, .. } => vec![name.clone()],
            Operation::RebuildTable(spec) => vec![spec.definition.name.clone()],
            Operation::Seed(set) => vec![set.table.clone()],
            Operation::Repair(spec) => vec![spec.membership.table.clone()],
            Operation::DropTable { name } => vec![name.clone()],
            Operation::DeleteSeeded { table } => vec![table.clone()],
            Operation::Execute { touches, .. } => touches.clone(),
            Operation::CreateIndex(_)
            | Operation::CreateTouchTrigger { .. }
            | Operation::CreateView { .. }
            | Operation::DropIndex { .. }
            | Operation::DropView { .. } => Vec::new(),
        }
    }

    /// Whether this operation is destructive (rebuilds or drops data).
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Operation::RebuildTable(_)
                | Operation::DropTable { .. }
                | Operation::DeleteSeeded { .. }
                | Operation::Execute { .. }
        )
    }
}

/// Tables, columns and row counts a step needs before it can run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisites {
    /// Tables that must exist.
    pub tables: Vec<String>,
    /// `(table, column)` pairs that must exist.
    pub columns: Vec<(String, String)>,
    /// `(table, minimum rows)` pairs.
    pub min_rows: Vec<(String, i64)>,
}

/// An entity table that must have no entity without an active membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanCheck {
    /// Entity table.
    pub entity_table: String,
    /// Membership table covering it.
    pub membership: MembershipTable,
    /// Season scope, or any season.
    pub season: Option<i64>,
}

impl OrphanCheck {
    /// Counter name used in validation reports.
    pub fn label(&self) -> String {
        match self.season {
            Some(season) => format!("{}:{}@{}", self.entity_table, self.membership.table, season),
            None => format!("{}:{}", self.entity_table, self.membership.table),
        }
    }
}

/// What the post-migration validator checks beyond the derived defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    /// Tables that must exist afterwards (in addition to created ones).
    pub tables: Vec<String>,
    /// `(table, column)` pairs that must be absent afterwards.
    pub removed_columns: Vec<(String, String)>,
    /// Tables whose row counts must be unchanged (in addition to rebuilt
    /// tables and their dependents).
    pub preserved: Vec<String>,
    /// Orphan scans that must return zero.
    pub no_orphans: Vec<OrphanCheck>,
}

/// One unit of schema change in the linear migration chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStep {
    /// Unique identifier, e.g. `005_memberships`.
    pub id: String,
    /// Identifier of the step this one follows; None for the root.
    pub predecessor: Option<String>,
    /// Human-readable description.
    pub description: String,
    /// Operations applied going forward.
    pub forward: Vec<Operation>,
    /// Operations undoing the forward action.
    pub reverse: Vec<Operation>,
    /// Requirements checked before anything runs.
    pub requires: Prerequisites,
    /// Post-migration expectations.
    pub expects: Expectations,
}

impl MigrationStep {
    /// Create an empty step.
    pub fn new(id: impl Into<String>, predecessor: Option<&str>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            predecessor: predecessor.map(str::to_string),
            description: description.into(),
            forward: Vec::new(),
            reverse: Vec::new(),
            requires: Prerequisites::default(),
            expects: Expectations::default(),
        }
    }

    /// Append a forward operation.
    pub fn forward(mut self, op: Operation) -> Self {
        self.forward.push(op);
        self
    }

    /// Append a reverse operation.
    pub fn reverse(mut self, op: Operation) -> Self {
        self.reverse.push(op);
        self
    }

    /// Require a table.
    pub fn requires_table(mut self, table: impl Into<String>) -> Self {
        self.requires.tables.push(table.into());
        self
    }

    /// Require a column.
    pub fn requires_column(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.requires.columns.push((table.into(), column.into()));
        self
    }

    /// Require a minimum row count.
    pub fn requires_rows(mut self, table: impl Into<String>, min: i64) -> Self {
        self.requires.min_rows.push((table.into(), min));
        self
    }

    /// Expect a column to be gone afterwards.
    pub fn expects_removed(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.expects.removed_columns.push((table.into(), column.into()));
        self
    }

    /// Expect a table's row count to survive unchanged.
    pub fn expects_preserved(mut self, table: impl Into<String>) -> Self {
        self.expects.preserved.push(table.into());
        self
    }

    /// Expect no orphans for an entity/membership pair.
    pub fn expects_no_orphans(mut self, check: OrphanCheck) -> Self {
        self.expects.no_orphans.push(check);
        self
    }

    /// Fingerprint of the step's identity and forward action.
    pub fn checksum(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            id: &'a str,
            predecessor: Option<&'a str>,
            forward: &'a [Operation],
        }

        let canonical = Canonical {
            id: &self.id,
            predecessor: self.predecessor.as_deref(),
            forward: &self.forward,
        };
        // Serializing plain data into a Vec cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(blake3::hash(&bytes).as_bytes())
    }

    /// Tables the forward action may change.
    pub fn touched_tables(&self) -> BTreeSet<String> {
        Self::touched_by(&self.forward)
    }

    /// Tables an operation list may change.
    pub fn touched_by(ops: &[Operation]) -> BTreeSet<String> {
        ops.iter().flat_map(Operation::touched_tables).collect()
    }

    /// Tables and enum lookup tables an operation list creates.
    pub fn created_tables(ops: &[Operation]) -> Vec<String> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::CreateTable(def) => Some(def.name.clone()),
                Operation::CreateEnum { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether the forward action rebuilds or drops anything.
    pub fn is_destructive(&self) -> bool {
        self.forward.iter().any(Operation::is_destructive)
    }

    /// Whether the forward action contains a table rebuild.
    pub fn has_rebuild(ops: &[Operation]) -> bool {
        ops.iter().any(|op| matches!(op, Operation::RebuildTable(_)))
    }
}
